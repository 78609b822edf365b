use oxc3::{
    Archive, CACompressionType, CAEncryptionType, CAFile, CASettings, DLCompressionType, DLEncryptionType,
    DLEntries, DLFile, DLSettings, DataType, OxError,
};
use std::fs;
use tempfile::NamedTempFile;

#[test]
fn oidl_round_trips_through_disk() {
    let file = DLFile::new(
        DLSettings::default(),
        DLEntries::Data(vec![vec![1, 2, 3], b"hello".to_vec()]),
    );
    let bytes = file.write(false).unwrap();

    let tmp = NamedTempFile::new().unwrap();
    fs::write(tmp.path(), &bytes).unwrap();
    let read_back = fs::read(tmp.path()).unwrap();

    let back = DLFile::read(&read_back, None, false).unwrap();
    match back.entries {
        DLEntries::Data(v) => {
            assert_eq!(v[0], vec![1, 2, 3]);
            assert_eq!(v[1], b"hello".to_vec());
        }
        _ => panic!("expected data entries"),
    }
}

#[test]
fn oica_packs_a_directory_tree_round_trip() {
    let mut archive = Archive::new();
    archive.add_file("readme.txt", b"hello world".to_vec(), 0).unwrap();
    archive.add_file("src/main.rs", b"fn main() {}".to_vec(), 0).unwrap();
    archive.add_file("src/lib.rs", b"pub fn x() {}".to_vec(), 0).unwrap();
    archive.add_directory("assets").unwrap();

    let ca = CAFile::new(CASettings::default(), archive);
    let bytes = ca.write().unwrap();

    let tmp = NamedTempFile::new().unwrap();
    fs::write(tmp.path(), &bytes).unwrap();
    let read_back = fs::read(tmp.path()).unwrap();

    let back = CAFile::read(&read_back, None).unwrap();
    assert!(back.archive.has_folder("src"));
    assert!(back.archive.has_folder("assets"));
    assert_eq!(back.archive.get_data("readme.txt").unwrap(), b"hello world");
    assert_eq!(back.archive.get_data("src/main.rs").unwrap(), b"fn main() {}");
    assert_eq!(back.archive.get_data("src/lib.rs").unwrap(), b"pub fn x() {}");

    let mut names: Vec<String> = Vec::new();
    back.archive.foreach("", true, None, |e| {
        names.push(e.path.clone());
        true
    });
    // Parents before children, case-insensitive ascending within a depth.
    let src_idx = names.iter().position(|n| n == "src").unwrap();
    let main_idx = names.iter().position(|n| n == "src/main.rs").unwrap();
    assert!(src_idx < main_idx);
}

#[test]
fn oica_encrypted_round_trip_end_to_end() {
    let mut archive = Archive::new();
    archive.add_file("secret.bin", b"classified payload".to_vec(), 0).unwrap();

    let key = [42u8; 32];
    let settings = CASettings {
        compression: CACompressionType::None,
        encryption: CAEncryptionType::Aes256Gcm,
        include_date: false,
        include_full_date: false,
        use_sha256: true,
        key: Some(key),
    };
    let ca = CAFile::new(settings, archive);
    let bytes = ca.write().unwrap();

    let tmp = NamedTempFile::new().unwrap();
    fs::write(tmp.path(), &bytes).unwrap();
    let read_back = fs::read(tmp.path()).unwrap();

    let back = CAFile::read(&read_back, Some(&key)).unwrap();
    assert_eq!(back.archive.get_data("secret.bin").unwrap(), b"classified payload");

    assert!(matches!(CAFile::read(&read_back, None), Err(OxError::Unauthorized(_))));

    let mut tampered = read_back.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    assert!(matches!(CAFile::read(&tampered, Some(&key)), Err(OxError::Unauthorized(_))));
}

#[test]
fn s6_archive_combine_disjoint_and_colliding() {
    let mut a = Archive::new();
    a.add_file("x/1", b"a".to_vec(), 0).unwrap();
    let mut b = Archive::new();
    b.add_file("y/2", b"b".to_vec(), 0).unwrap();

    let combined = a.combine(&b).unwrap();
    assert!(combined.has_file("x/1"));
    assert!(combined.has_file("y/2"));

    let mut c = Archive::new();
    c.add_file("x/1", b"conflict".to_vec(), 0).unwrap();
    assert!(matches!(a.combine(&c), Err(OxError::AlreadyDefined(_))));
}

#[test]
fn dlpack_ascii_and_utf8_settings_are_mutually_exclusive_data_kinds() {
    let ascii = DLFile::new(
        DLSettings {
            compression: DLCompressionType::None,
            encryption: DLEncryptionType::None,
            data_type: DataType::Ascii,
            use_sha256: false,
            key: None,
        },
        DLEntries::Ascii(vec!["alpha".into(), "beta".into()]),
    );
    let bytes = ascii.write(false).unwrap();
    let back = DLFile::read(&bytes, None, false).unwrap();
    match back.entries {
        DLEntries::Ascii(v) => assert_eq!(v, vec!["alpha".to_string(), "beta".to_string()]),
        _ => panic!("expected ascii entries"),
    }
}
