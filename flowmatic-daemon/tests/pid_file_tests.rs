//! PID file creation, deletion, and duplicate detection tests.

use std::fs;

use flowmatic_daemon::orchestrator::{remove_pid_file, write_pid_file};
use tempfile::TempDir;

#[test]
fn test_write_pid_file_creates_parent_directory() {
    // Given: A path whose parent directory does not exist yet
    let temp_dir = TempDir::new().unwrap();
    let pid_path = temp_dir.path().join("run").join("nested").join("flowmatic.pid");

    // When: Writing the PID file
    write_pid_file(&pid_path).expect("should write PID file");

    // Then: The file holds the current PID
    let content = fs::read_to_string(&pid_path).unwrap();
    assert_eq!(content.trim(), std::process::id().to_string());
}

#[cfg(unix)]
#[test]
fn test_pid_file_and_directory_permissions_are_restrictive() {
    use std::os::unix::fs::PermissionsExt;

    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("piddir");
    let pid_path = dir.join("flowmatic.pid");

    write_pid_file(&pid_path).unwrap();

    let file_mode = fs::metadata(&pid_path).unwrap().permissions().mode() & 0o777;
    let dir_mode = fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
    assert_eq!(file_mode, 0o600);
    assert_eq!(dir_mode, 0o700);
}

#[test]
fn test_write_pid_file_fails_if_already_exists() {
    // Given: An existing PID file from another instance
    let temp_dir = TempDir::new().unwrap();
    let pid_path = temp_dir.path().join("flowmatic.pid");
    fs::write(&pid_path, "12345\n").unwrap();

    // When: Writing again
    let err = write_pid_file(&pid_path).unwrap_err().to_string();

    // Then: The error names the existing PID and the file is untouched
    assert!(err.contains("already exists"), "got: {err}");
    assert!(err.contains("12345"), "got: {err}");
    assert_eq!(fs::read_to_string(&pid_path).unwrap(), "12345\n");
}

#[cfg(unix)]
#[test]
fn test_write_pid_file_refuses_symlink() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("victim");
    fs::write(&target, "keep").unwrap();
    let pid_path = temp_dir.path().join("flowmatic.pid");
    std::os::unix::fs::symlink(&target, &pid_path).unwrap();

    assert!(write_pid_file(&pid_path).is_err());
    assert_eq!(fs::read_to_string(&target).unwrap(), "keep");
}

#[test]
fn test_remove_pid_file_deletes_file() {
    let temp_dir = TempDir::new().unwrap();
    let pid_path = temp_dir.path().join("flowmatic.pid");
    write_pid_file(&pid_path).unwrap();

    remove_pid_file(&pid_path);

    assert!(!pid_path.exists());
}

#[test]
fn test_remove_pid_file_handles_nonexistent_gracefully() {
    let temp_dir = TempDir::new().unwrap();
    let pid_path = temp_dir.path().join("never-written.pid");

    // Should log a warning, not panic
    remove_pid_file(&pid_path);

    assert!(!pid_path.exists());
}

#[test]
fn test_pid_file_can_be_rewritten_after_removal() {
    let temp_dir = TempDir::new().unwrap();
    let pid_path = temp_dir.path().join("flowmatic.pid");

    write_pid_file(&pid_path).unwrap();
    remove_pid_file(&pid_path);
    write_pid_file(&pid_path).expect("second daemon run should succeed");

    assert!(pid_path.exists());
}
