//! Filesystem utilities the core relies on but treats as an external
//! collaborator: filename disambiguation, atomic rename, and the
//! platform default download directory (SPEC_FULL.md §4.6, §6).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Picks a download directory outside of any project workspace:
/// `dirs::download_dir()`, falling back to the home directory, then
/// the current directory.
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Finds the smallest `n >= 0` such that `<folder>/<filename>(n)` (or
/// just `<folder>/<filename>` for `n == 0`) is free both as a final
/// name and, during loading, as a `.dl` temp name -- so a download
/// started today never collides with one still in flight, or with a
/// finished file from a previous run (SPEC_FULL.md §6). The counter is
/// appended to the whole filename, after any extension, matching the
/// reference implementation's `_fix_filename` (`archive.zip` ->
/// `archive.zip(1)`, not `archive (1).zip`).
pub fn disambiguate_filename(folder: &Path, filename: &str) -> String {
    disambiguate(folder, filename, true)
}

/// Like `disambiguate_filename`, but only checks the final name, not
/// the `.dl` temp name. Used when a download finishes: the temp file
/// about to be renamed away is this download's own, so checking for
/// its existence would always (wrongly) count the name as taken
/// (SPEC_FULL.md §4.6 "Finish": "ignoring the -if-dl-exists rule since
/// the temp file is about to disappear").
pub fn finalize_filename(folder: &Path, filename: &str) -> String {
    disambiguate(folder, filename, false)
}

fn disambiguate(folder: &Path, filename: &str, check_temp: bool) -> String {
    for n in 0.. {
        let candidate = if n == 0 {
            filename.to_string()
        } else {
            format!("{filename}({n})")
        };

        let final_path = folder.join(&candidate);
        let temp_taken = check_temp && folder.join(format!("{candidate}.dl")).exists();
        if !final_path.exists() && !temp_taken {
            return candidate;
        }
    }
    unreachable!("the loop above always returns before u32 range is exhausted")
}

/// Renames `from` to `to`, falling back to copy-then-remove when the
/// rename fails because the two paths live on different filesystems
/// (`std::fs::rename` on most platforms refuses cross-device moves).
pub fn atomic_rename(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}
