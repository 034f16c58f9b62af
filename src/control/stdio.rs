//! Stdout writes for the control line.
//!
//! - **stdout**: the listen address, one line, nothing else
//! - **stderr**: logs

use std::io::Write;
use std::path::Path;

/// Write a line to stdout.
///
/// Writes the string followed by a single `\n` and flushes, so a parent
/// blocked on `readline` sees it immediately.
pub fn write_stdout_line(line: &str) -> std::io::Result<()> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    handle.write_all(line.as_bytes())?;
    handle.write_all(b"\n")?;
    handle.flush()?;
    Ok(())
}

/// Announce the socket path on stdout.
pub fn announce_address(path: &Path) -> std::io::Result<()> {
    write_stdout_line(&path.to_string_lossy())
}
