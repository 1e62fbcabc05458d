fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/fleetkv.proto");
    tonic_build::compile_protos("proto/fleetkv.proto")?;
    Ok(())
}
