use nix::{
    errno::Errno,
    unistd::{access, AccessFlags},
};
use std::{env, ffi::CString, path::Path};

use crate::diag::{Error, Result};

fn is_executable(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

fn find_executable_in_path(file_name: &str) -> Option<String> {
    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths).find_map(|dir| {
            let full_path = dir.join(file_name);
            if is_executable(&full_path) {
                full_path.to_str().map(String::from)
            } else {
                None
            }
        })
    })
}

/// Resolve a program name the way a shell would: names containing a slash
/// are taken as they are, bare names are searched in `PATH`.
///
/// # Errors
///
/// Will return `ENOENT` if a bare name is not found in `PATH`.
pub fn program(name: &str) -> Result<String> {
    if name.contains('/') {
        return Ok(name.to_string());
    }
    find_executable_in_path(name).ok_or_else(|| Error::from(Errno::ENOENT))
}

/// The command to run, from this program's arguments, with the program
/// resolved.
///
/// # Errors
///
/// Will return `Err` if no command is provided, if the command is not found,
/// or if an argument is not UTF-8.
pub fn args() -> Result<Vec<String>> {
    let this = env::args_os()
        .next()
        .map(|arg| arg.to_string_lossy().into_owned())
        .ok_or_else(|| Error::from(Errno::EINVAL))?;
    let mut args = env::args_os()
        .skip(1)
        .map(|arg| {
            arg.into_string()
                .map_err(|_| Error::from("Error: argument is not UTF-8"))
        })
        .collect::<Result<Vec<String>>>()?;

    if args.is_empty() {
        eprintln!("Usage: {this} command [args]");
        return Err(Error::from(Errno::EINVAL));
    }
    args[0] = program(&args[0])?;
    Ok(args)
}

/// # Errors
///
/// Will return `Err` if failing to convert environment variables to `CString`.
pub fn env() -> Result<Vec<CString>> {
    env::vars_os()
        .map(|(key, val)| {
            let e = "Error: OsString conversion failed";
            let key_str = key.into_string().map_err(|_| Error::from(e))?;
            let val_str = val.into_string().map_err(|_| Error::from(e))?;
            CString::new(format!("{key_str}={val_str}")).map_err(Error::from)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program() {
        assert_eq!(program("./build.sh").expect("relative"), "./build.sh");
        assert_eq!(program("/bin/true").expect("absolute"), "/bin/true");
        let sh = program("sh").expect("in PATH");
        assert!(sh.ends_with("/sh"));
        assert!(Path::new(&sh).is_absolute() || sh.starts_with('.'));
        assert_eq!(
            program("surely-not-a-real-program").expect_err("missing").errno(),
            Some(Errno::ENOENT as i32)
        );
    }

    #[test]
    fn test_env_has_path() {
        let env = env().expect("env");
        assert!(env.iter().any(|var| var.as_bytes().starts_with(b"PATH=")));
    }
}
