use std::{
    convert::Infallible,
    fs::{self, DirBuilder, File, OpenOptions},
    io::{self, Write},
    os::unix::fs::{chown, DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt},
    path::Path,
    process,
};

use crate::{
    action::Output,
    diag::{Error, Result, Sink},
    trace::Trace,
};

const STDOUT: &str = "/dev/stdout";
const STDERR: &str = "/dev/stderr";

fn fix_mode(path: &str, mode: u32) -> Result<()> {
    let current = fs::metadata(path)?.mode() & 0o7777;
    if current != mode & 0o7777 {
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
    }
    Ok(())
}

fn fix_owner(path: &str, uid: u32, gid: u32) -> Result<()> {
    let md = fs::metadata(path)?;
    if md.uid() != uid || md.gid() != gid {
        chown(path, Some(uid), Some(gid))?;
    }
    Ok(())
}

fn mkdir(path: &str, mode: u32) -> Result<()> {
    match DirBuilder::new().mode(mode & 0o7777).create(path) {
        Err(e) if e.kind() != io::ErrorKind::AlreadyExists => return Err(e.into()),
        _ => {}
    }
    fix_mode(path, mode)
}

fn write(path: &str, copy: &Path) -> Result<()> {
    let mut source = File::open(copy)?;
    match path {
        STDOUT => {
            let mut out = io::stdout().lock();
            io::copy(&mut source, &mut out)?;
            out.flush()?;
        }
        STDERR => {
            io::copy(&mut source, &mut io::stderr().lock())?;
        }
        _ => {
            let mut target = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o644)
                .open(path)?;
            io::copy(&mut source, &mut target)?;
        }
    }
    Ok(())
}

/// Recreate a single recorded effect.
///
/// # Arguments
///
/// * `output` - The effect to reproduce.
/// * `root` - Trace root that cached copies are relative to.
///
/// # Errors
///
/// Returns `Err` if the filesystem refuses the change or a `Write` has no
/// cached copy.
pub fn output(output: &Output, root: &Path) -> Result<()> {
    match output {
        Output::Chmod { path, mode } => fix_mode(path, *mode),
        Output::Chown { path, uid, gid } => fix_owner(path, *uid, *gid),
        Output::Mkdir { path, mode } => mkdir(path, *mode),
        Output::Write {
            path,
            cached_copy: Some(copy),
        } => write(path, &root.join(copy)),
        Output::Write {
            path,
            cached_copy: None,
        } => Err(Error::from(format!("Error: no cached copy of {path}"))),
    }
}

/// Materialize every output of `trace`, in recorded order.
///
/// # Errors
///
/// Returns the first failure; earlier outputs stay applied.
pub fn apply(trace: &Trace, root: &Path, sink: &dyn Sink) -> Result<()> {
    for out in &trace.outputs {
        sink.emit(format_args!("replay {out}"));
        output(out, root)?;
    }
    Ok(())
}

/// Materialize `trace` and terminate the calling process with its recorded
/// exit status.
///
/// # Errors
///
/// Only returns, with `Err`, when an output could not be applied.
pub fn replay(trace: &Trace, root: &Path, sink: &dyn Sink) -> Result<Infallible> {
    apply(trace, root, sink)?;
    io::stdout().flush()?;
    process::exit(trace.exit_status)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{command::Command, diag::Silent};
    use tempfile::tempdir;

    fn trace(outputs: Vec<Output>) -> Trace {
        Trace {
            command: Command::new(vec!["/bin/true".to_string()], "/").expect("command"),
            inputs: vec![],
            outputs,
            exit_status: 0,
        }
    }

    fn utf8(path: &Path) -> String {
        path.to_str().expect("utf-8").to_string()
    }

    #[test]
    fn test_apply_recreates_files_and_dirs() {
        let root = tempdir().expect("root");
        let work = tempdir().expect("work");
        fs::write(root.path().join("copy"), "hello").expect("write");

        let dir = utf8(&work.path().join("sub"));
        let file = utf8(&work.path().join("sub/out.txt"));
        let trace = trace(vec![
            Output::Mkdir { path: dir.clone(), mode: 0o750 },
            Output::Write {
                path: file.clone(),
                cached_copy: Some("copy".to_string()),
            },
            Output::Chmod { path: file.clone(), mode: 0o600 },
        ]);

        apply(&trace, root.path(), &Silent).expect("apply");
        assert_eq!(fs::read_to_string(&file).expect("read"), "hello");
        assert_eq!(fs::metadata(&file).expect("stat").mode() & 0o7777, 0o600);
        assert_eq!(fs::metadata(&dir).expect("stat").mode() & 0o7777, 0o750);

        // Applying again over the existing tree is harmless.
        apply(&trace, root.path(), &Silent).expect("apply twice");
        assert_eq!(fs::read_to_string(&file).expect("read"), "hello");
    }

    #[test]
    fn test_write_truncates() {
        let root = tempdir().expect("root");
        let work = tempdir().expect("work");
        fs::write(root.path().join("copy"), "hi").expect("write");
        let file = work.path().join("f");
        fs::write(&file, "much longer content").expect("write");

        output(
            &Output::Write {
                path: utf8(&file),
                cached_copy: Some("copy".to_string()),
            },
            root.path(),
        )
        .expect("write");
        assert_eq!(fs::read_to_string(&file).expect("read"), "hi");
    }

    #[test]
    fn test_chown_to_current_owner_is_noop() {
        let work = tempdir().expect("work");
        let md = fs::metadata(work.path()).expect("stat");
        let out = Output::Chown {
            path: utf8(work.path()),
            uid: md.uid(),
            gid: md.gid(),
        };
        assert!(output(&out, work.path()).is_ok());
    }

    #[test]
    fn test_missing_copy_fails() {
        let root = tempdir().expect("root");
        assert!(output(&Output::write("/tmp/never"), root.path()).is_err());
        let out = Output::Write {
            path: utf8(&root.path().join("target")),
            cached_copy: Some("absent".to_string()),
        };
        assert!(output(&out, root.path()).is_err());
    }
}
