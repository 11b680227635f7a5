use std::error::Error;
use std::path::Path;
use std::process::Command;

use walkdir::WalkDir;

fn main() -> Result<(), Box<dyn Error>> {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR")?;
    let test_dir = Path::new(&manifest_dir).join("..").join("test");
    let out_dir = std::env::var("OUT_DIR")?;

    println!("cargo:rerun-if-changed={}", test_dir.display());

    if !test_dir.is_dir() {
        return Ok(());
    }

    let sources : Vec<_> =
        WalkDir::new(&test_dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().map(|x| x == "java").unwrap_or(false))
            .map(|e| e.path().to_owned())
            .collect();

    if sources.is_empty() {
        return Ok(());
    }

    // A missing JDK only disables the tests that consume compiled classes
    match Command::new("javac")
        .args(&[ "-d", &out_dir ])
        .arg("-g:none")
        .args(&sources)
        .status()
    {
        Ok(status) if status.success() => {},
        Ok(status) => println!("cargo:warning=javac exited with {}", status),
        Err(e) => println!("cargo:warning=javac unavailable: {}", e),
    }

    Ok(())
}
