use std::{fs, path::Path, process::Command};

pub fn test_no_args(path: &str) {
    let output = Command::new(path).output().expect("Failed to run binary");

    assert!(
        !output.status.success(),
        "binary execution should have failed"
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(stdout.is_empty(), "stdout: {}", stdout);
    assert!(
        stderr.contains(format!("Usage: {} command [args]", path).as_str()),
        "stderr: {}",
        stderr
    );
    assert!(
        stderr.contains("Error: EINVAL: Invalid argument"),
        "stderr: {}",
        stderr
    );
}

pub struct Cleanup<'a> {
    pub path: &'a Path,
}

impl<'a> Drop for Cleanup<'a> {
    fn drop(&mut self) {
        if self.path.exists() {
            fs::remove_file(self.path).expect("Failed to clean up compiled binary");
        }
    }
}

/// Compile `tests/programs/<name>.c` next to its source and return the
/// binary path.
pub fn build_program(name: &str) -> String {
    let root = env!("CARGO_MANIFEST_DIR");
    let source = format!("{}/tests/programs/{}.c", root, name);
    let bin = format!("{}/tests/programs/{}", root, name);
    let output = Command::new("gcc")
        .arg("-O1")
        .arg("-o")
        .arg(&bin)
        .arg(&source)
        .output()
        .expect("Failed to compile binary");
    assert!(
        output.status.success(),
        "Compilation failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    bin
}

/// Names of the cached traces under a store bucket.
pub fn traces(bucket: &Path) -> Vec<String> {
    match fs::read_dir(bucket) {
        Ok(entries) => entries
            .map(|entry| entry.expect("Failed to list bucket").file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".trace"))
            .collect(),
        Err(_) => vec![],
    }
}
