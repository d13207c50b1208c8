//! Small adb helpers used by custom recognitions.

use std::{
    io,
    path::Path,
    process::{Command, Stdio},
};

/// Package currently holding `topResumedActivity`, if the device reports one.
pub fn foreground_package(adb_path: &Path, serial: &str) -> io::Result<Option<String>> {
    let output = Command::new(adb_path)
        .args(["-s", serial, "shell", "dumpsys", "activity", "activities"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "adb exited with {}",
            output.status
        )));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(parse_top_resumed(&text).map(str::to_string))
}

/// Extracts the package from the last `topResumedActivity` line of
/// `dumpsys activity activities` output.
pub fn parse_top_resumed(output: &str) -> Option<&str> {
    output
        .lines()
        .filter(|line| line.contains("topResumedActivity"))
        .filter_map(|line| {
            line.split_whitespace()
                .find(|part| part.contains('/'))
                .and_then(|component| component.split('/').next())
        })
        .last()
}
