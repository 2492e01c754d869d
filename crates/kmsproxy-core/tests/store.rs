use std::fs;

use chrono::Utc;
use kmsproxy::error::StoreError;
use kmsproxy::tls::{AccountState, CertificateBundle, CertificateStore};
use tempfile::TempDir;

fn domains() -> Vec<String> {
    vec!["kms.example.com".to_string(), "alt.example.com".to_string()]
}

fn account() -> AccountState {
    AccountState::new(
        "ops@example.com",
        r#"{"id":"https://acme.example.com/acct/1"}"#.to_string(),
        "c2VjcmV0".to_string(),
    )
}

fn bundle() -> CertificateBundle {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(domains()).unwrap();
    let cert = params.self_signed(&key_pair).unwrap();

    CertificateBundle::new(domains(), cert.pem(), key_pair.serialize_pem(), Utc::now())
}

#[test]
fn test_empty_workdir_is_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let store = CertificateStore::new(temp_dir.path().join("state"), domains());

    assert!(matches!(store.load(), Err(StoreError::NotFound)));
    assert!(store.load_bundle().unwrap().is_none());
}

#[test]
fn test_save_and_load() {
    let temp_dir = TempDir::new().unwrap();
    let store = CertificateStore::new(temp_dir.path().join("state"), domains());
    let bundle = bundle();

    store.save_account(&account()).unwrap();
    store.save_bundle(&bundle).unwrap();

    let (loaded_account, loaded_bundle) = store.load().unwrap();
    assert_eq!(loaded_account, account());
    assert_eq!(loaded_bundle.domains, domains());
    assert_eq!(loaded_bundle.certificate_chain, bundle.certificate_chain);
    assert_eq!(loaded_bundle.private_key, bundle.private_key);
}

#[test]
fn test_issuance_record_written() {
    let temp_dir = TempDir::new().unwrap();
    let store = CertificateStore::new(temp_dir.path(), domains());

    store.save_bundle(&bundle()).unwrap();

    let path = temp_dir.path().join("certs").join("kms.example.com");
    assert_eq!(store.metadata_path().unwrap(), path);

    let record: serde_json::Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
    assert_eq!(record["domains"][0], "kms.example.com");
    assert!(record["not_after"].is_string());
    assert!(record["serial"].is_string());
}

#[test]
fn test_bundle_replaced_without_leftovers() {
    let temp_dir = TempDir::new().unwrap();
    let store = CertificateStore::new(temp_dir.path(), domains());

    store.save_bundle(&bundle()).unwrap();
    let second = bundle();
    store.save_bundle(&second).unwrap();

    let loaded = store.load_bundle().unwrap().unwrap();
    assert_eq!(loaded.certificate_chain, second.certificate_chain);

    let mut entries: Vec<String> = fs::read_dir(temp_dir.path().join("certs"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    entries.sort();
    assert_eq!(entries, vec!["cert.pem", "key.pem", "kms.example.com"]);
}

#[cfg(unix)]
#[test]
fn test_files_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("state");
    let store = CertificateStore::new(&root, domains());

    store.save_account(&account()).unwrap();
    store.save_bundle(&bundle()).unwrap();

    let mode = |path: std::path::PathBuf| fs::metadata(path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode(root.clone()), 0o700);
    assert_eq!(mode(root.join("certs")), 0o700);
    assert_eq!(mode(store.state_path()), 0o600);
    assert_eq!(mode(store.key_path()), 0o600);
    assert_eq!(mode(store.cert_path()), 0o600);
}

#[test]
fn test_account_without_bundle() {
    let temp_dir = TempDir::new().unwrap();
    let store = CertificateStore::new(temp_dir.path(), domains());
    store.save_account(&account()).unwrap();

    assert!(matches!(store.load(), Err(StoreError::Corrupt { .. })));

    let (loaded, bundle) = store.load_state().unwrap();
    assert_eq!(loaded, account());
    assert!(bundle.is_none());
}

#[test]
fn test_partial_bundle_is_corrupt() {
    let temp_dir = TempDir::new().unwrap();
    let store = CertificateStore::new(temp_dir.path(), domains());
    store.save_account(&account()).unwrap();
    store.save_bundle(&bundle()).unwrap();

    fs::remove_file(store.cert_path()).unwrap();

    assert!(matches!(store.load_bundle(), Err(StoreError::Corrupt { .. })));
    assert!(matches!(store.load(), Err(StoreError::Corrupt { .. })));
}

#[test]
fn test_empty_key_is_corrupt() {
    let temp_dir = TempDir::new().unwrap();
    let store = CertificateStore::new(temp_dir.path(), domains());
    store.save_bundle(&bundle()).unwrap();

    fs::write(store.key_path(), b"").unwrap();

    assert!(matches!(store.load_bundle(), Err(StoreError::Corrupt { .. })));
}

#[test]
fn test_unparseable_state_is_corrupt() {
    let temp_dir = TempDir::new().unwrap();
    let store = CertificateStore::new(temp_dir.path(), domains());
    store.save_bundle(&bundle()).unwrap();

    fs::write(store.state_path(), b"{ not json").unwrap();

    assert!(matches!(store.load(), Err(StoreError::Corrupt { .. })));
}

#[test]
fn test_state_without_key_is_corrupt() {
    let temp_dir = TempDir::new().unwrap();
    let store = CertificateStore::new(temp_dir.path(), domains());

    let account = AccountState::new("ops@example.com", "{}".to_string(), String::new());
    store.save_account(&account).unwrap();

    assert!(matches!(store.load_state(), Err(StoreError::Corrupt { .. })));
}
