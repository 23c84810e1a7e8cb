use std::fs;

use camino::Utf8PathBuf;

use kira_mirror::domain::BankType;
use kira_mirror::error::MirrorError;
use kira_mirror::install::ProductionInstaller;

fn utf8(path: &std::path::Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
}

#[test]
fn history_keeps_the_newest_versions() {
    let temp = tempfile::tempdir().unwrap();
    let installer = ProductionInstaller::new(utf8(&temp.path().join("prod")));

    for version in 1..=4 {
        let work = temp.path().join(format!("work{version}"));
        fs::create_dir_all(work.join("index")).unwrap();
        fs::write(work.join("release.txt"), format!("v{version}")).unwrap();
        fs::write(work.join("index").join("sprot.idx"), vec![0u8; version * 10]).unwrap();
        let report = installer
            .install(BankType::Protein, "sprot", &utf8(&work), 2)
            .unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(report.history.len(), (version - 1).min(2));
    }

    let current = installer.current_dir(BankType::Protein, "sprot");
    assert_eq!(fs::read_to_string(current.join("release.txt")).unwrap(), "v4");

    let history = installer.history(BankType::Protein, "sprot").unwrap();
    assert_eq!(history.len(), 2);
    let kept: Vec<String> = history
        .iter()
        .map(|dir| fs::read_to_string(dir.join("release.txt")).unwrap())
        .collect();
    assert_eq!(kept, vec!["v2", "v3"]);
}

#[test]
fn missing_work_tree_leaves_current_alone() {
    let temp = tempfile::tempdir().unwrap();
    let installer = ProductionInstaller::new(utf8(&temp.path().join("prod")));
    let work = temp.path().join("work");
    fs::create_dir_all(&work).unwrap();
    fs::write(work.join("a"), b"a").unwrap();
    installer.install(BankType::Nucleic, "est", &utf8(&work), 1).unwrap();

    let err = installer
        .install(BankType::Nucleic, "est", &utf8(&temp.path().join("gone")), 1)
        .unwrap_err();
    assert!(matches!(err, MirrorError::Install(_)));
    let current = installer.current_dir(BankType::Nucleic, "est");
    assert_eq!(fs::read(current.join("a")).unwrap(), b"a");
}

#[test]
fn interrupted_swap_is_restored() {
    let temp = tempfile::tempdir().unwrap();
    let installer = ProductionInstaller::new(utf8(&temp.path().join("prod")));
    let work = temp.path().join("work");
    fs::create_dir_all(&work).unwrap();
    fs::write(work.join("release.txt"), b"v1").unwrap();
    installer.install(BankType::Protein, "sprot", &utf8(&work), 1).unwrap();

    // State left by a run stopped between the two renames.
    let current = installer.current_dir(BankType::Protein, "sprot");
    let slot = installer.history_dir(BankType::Protein, "sprot").join("20200615083000");
    fs::create_dir_all(slot.parent().unwrap()).unwrap();
    fs::rename(&current, &slot).unwrap();
    let marker = installer.bank_dir(BankType::Protein, "sprot").join(".swap");
    fs::write(&marker, slot.as_str()).unwrap();

    assert!(installer.recover(BankType::Protein, "sprot").unwrap());
    assert_eq!(fs::read(current.join("release.txt")).unwrap(), b"v1");
    assert!(!marker.exists());
    assert!(installer.history(BankType::Protein, "sprot").unwrap().is_empty());
    assert!(!installer.recover(BankType::Protein, "sprot").unwrap());

    fs::rename(&current, &slot).unwrap();
    fs::write(&marker, slot.as_str()).unwrap();
    fs::write(work.join("release.txt"), b"v2").unwrap();
    let report = installer.install(BankType::Protein, "sprot", &utf8(&work), 1).unwrap();
    assert_eq!(fs::read(current.join("release.txt")).unwrap(), b"v2");
    assert_eq!(report.history.len(), 1);
    let kept = &installer.history(BankType::Protein, "sprot").unwrap()[0];
    assert_eq!(fs::read(kept.join("release.txt")).unwrap(), b"v1");
}
