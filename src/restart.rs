//! Device restart.
//!
//! The node restarts by replacing its own process image with the firmware image
//! (the freshly installed one after an update). If that fails the process exits
//! with `EX_TEMPFAIL` so the service manager brings it back up.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{error, info, warn};

use crate::controller::RestartReason;

pub const RESTART_EXIT_CODE: i32 = 75;

pub fn restart(reason: RestartReason, firmware: Option<&Path>) -> ! {
    info!("Restarting device: {}", reason);

    match boot_program(firmware) {
        Some(program) => {
            let args: Vec<_> = std::env::args_os().skip(1).collect();
            // exec only returns on failure
            let err = Command::new(&program).args(&args).exec();
            error!("Failed to exec {}: {}", program.display(), err);
        }
        None => error!("Unable to locate an executable to restart into"),
    }

    std::process::exit(RESTART_EXIT_CODE)
}

/// The program a restart executes: the firmware image if it exists, else the
/// running executable.
pub fn boot_program(firmware: Option<&Path>) -> Option<PathBuf> {
    if let Some(image) = firmware {
        if image.is_file() {
            return Some(image.to_path_buf());
        }
        warn!("Firmware image {} missing, restarting current executable", image.display());
    }
    std::env::current_exe().ok()
}
