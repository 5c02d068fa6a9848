use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::process::Command;
use tempfile::tempdir;

/// The binary with an unprivileged `sh -c` session, so tests run on the caller's own files.
fn rootvault() -> Command {
    let mut cmd = Command::cargo_bin("rootvault").unwrap();
    cmd.env("ROOTVAULT_SHELL", "sh").env_remove("ROOTVAULT_UTIL_BOX").env_remove("RUST_LOG");
    cmd
}

fn build_app_dir(root: &std::path::Path) {
    fs::create_dir_all(root.join("shared_prefs")).unwrap();
    fs::create_dir_all(root.join("cache")).unwrap();
    fs::write(root.join("shared_prefs/settings.xml"), b"<map><int name=\"x\" value=\"1\"/></map>").unwrap();
    fs::write(root.join("cache/thumb.bin"), vec![1u8; 1024]).unwrap();
    fs::set_permissions(root.join("shared_prefs/settings.xml"), fs::Permissions::from_mode(0o660)).unwrap();
    std::os::unix::fs::symlink("/data/app/lib/arm64", root.join("lib")).unwrap();
}

#[test]
fn test_cli_backup_list_restore_cycle() -> Result<(), Box<dyn std::error::Error>> {
    let source = tempdir()?;
    let app = source.path().join("org.example.app");
    build_app_dir(&app);
    let store = tempdir()?;
    let archive_dir = store.path().join("backups");

    // 1. Backup (archive directory is created on demand)
    rootvault()
        .arg("backup")
        .arg(&app)
        .arg("--output")
        .arg(&archive_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("org.example.app.tar.zst"));
    let archive = archive_dir.join("org.example.app.tar.zst");
    assert!(archive.is_file());

    // 2. List
    rootvault()
        .arg("list")
        .arg(&archive)
        .assert()
        .success()
        .stdout(
            predicate::str::contains("shared_prefs/settings.xml")
                .and(predicate::str::contains("f 0660"))
                .and(predicate::str::contains("lib -> /data/app/lib/arm64")),
        );

    // 3. Restore through the shell with the default exclusions (lib, cache, code_cache)
    let target = tempdir()?;
    rootvault()
        .arg("restore")
        .arg(&archive)
        .arg("-o")
        .arg(target.path())
        .arg("--mode")
        .arg("shell")
        .assert()
        .success()
        .stdout(predicate::str::contains("3 excluded"));

    let restored = target.path().join("shared_prefs/settings.xml");
    assert_eq!(fs::read(&restored)?, fs::read(app.join("shared_prefs/settings.xml"))?);
    assert_eq!(fs::metadata(&restored)?.permissions().mode() & 0o7777, 0o660);
    assert!(!target.path().join("cache").exists());
    assert!(fs::symlink_metadata(target.path().join("lib")).is_err());
    Ok(())
}

#[test]
fn test_cli_restore_without_default_excludes() -> Result<(), Box<dyn std::error::Error>> {
    let source = tempdir()?;
    build_app_dir(source.path());
    let store = tempdir()?;

    rootvault()
        .args(["backup", "--direct", "--compression", "none", "--name", "plain", "-o"])
        .arg(store.path())
        .arg(source.path())
        .assert()
        .success();
    let archive = store.path().join("plain.tar");
    assert!(archive.is_file());

    let target = tempdir()?;
    rootvault()
        .arg("restore")
        .arg(&archive)
        .arg("-o")
        .arg(target.path())
        .args(["--mode", "direct", "--no-default-excludes", "--exclude", "shared_prefs"])
        .assert()
        .success();

    assert_eq!(fs::read(target.path().join("cache/thumb.bin"))?.len(), 1024);
    assert!(!target.path().join("shared_prefs").exists());
    assert_eq!(fs::read_link(target.path().join("lib"))?, std::path::Path::new("/data/app/lib/arm64"));
    Ok(())
}

#[test]
fn test_cli_ls_lists_through_shell() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    fs::create_dir(dir.path().join("sub"))?;
    fs::write(dir.path().join("sub/inner.txt"), b"x")?;

    rootvault()
        .arg("ls")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("d ").and(predicate::str::contains("sub/inner.txt").not()));

    rootvault()
        .args(["ls", "--recursive"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("sub/inner.txt"));
    Ok(())
}

#[test]
fn test_cli_restore_missing_archive_fails() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    rootvault()
        .arg("restore")
        .arg(dir.path().join("nope.tar.zst"))
        .arg("-o")
        .arg(dir.path().join("out"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
    Ok(())
}

#[test]
fn test_cli_rejects_invalid_config() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let config = dir.path().join("config.json");
    fs::write(&config, r#"{ "zstd_level": 99 }"#)?;
    rootvault()
        .arg("--config")
        .arg(&config)
        .arg("ls")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"));
    Ok(())
}
