use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, exit};

const MAIN_BINARY: &str = "mlops-pipeline";

// Same procedure on every operator platform: forward to `mlops-pipeline provision`.
fn main() {
    let args: Vec<OsString> = env::args_os().skip(1).collect();

    match Command::new(main_binary())
        .arg("provision")
        .args(&args)
        .status()
    {
        Ok(status) => {
            if let Some(code) = status.code() {
                if code != 0 {
                    exit(code);
                }
            } else {
                exit(1);
            }
        }
        Err(err) => {
            eprintln!("Failed to invoke {MAIN_BINARY}: {err}");
            exit(1);
        }
    }
}

/// The binary installed next to this one, else whatever `PATH` resolves.
fn main_binary() -> PathBuf {
    let file_name = format!("{MAIN_BINARY}{}", env::consts::EXE_SUFFIX);
    env::current_exe()
        .ok()
        .map(|exe| exe.with_file_name(&file_name))
        .filter(|sibling| sibling.is_file())
        .unwrap_or_else(|| PathBuf::from(MAIN_BINARY))
}
