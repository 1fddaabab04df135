//! Receiver script fed into the remote shell.
//!
//! The script reads one frame marker line, extracts one archive, and repeats
//! until the stream closes. The marker gives the loop a clean way to notice
//! end of stream: `read` fails on EOF and the loop ends with status 0, while a
//! failed extraction is swallowed and the loop keeps going.

use std::path::Path;

/// Byte written ahead of every archive. `read -r` in the receiver loop
/// consumes exactly this line before handing stdin to tar.
pub const FRAME_MARKER: &[u8] = b"\n";

/// Build the receiver script for `dest_dir`.
pub fn receiver_script(dest_dir: &Path, clean_first: bool, extract_command: &str) -> String {
    let dest = shell_escape(&dest_dir.to_string_lossy());
    let mut script = String::from("set -e\n");
    if clean_first {
        script.push_str(&format!("rm -rf {dest}/*\n"));
    }
    script.push_str(&format!("mkdir -p {dest}\n"));
    script.push_str(&format!("cd {dest}\n"));
    script.push_str("while IFS= read -r _; do\n");
    script.push_str(&format!("    {extract_command} 2>/dev/null || true\n"));
    script.push_str("done\n");
    script
}

/// Quote `s` for POSIX shells.
pub fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"/._-+,:@%".contains(&b))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
