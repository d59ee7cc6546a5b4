use std::collections::BTreeMap;
use std::path::Path;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

use burrow::{BPTree, FieldKind, Record, StoreError, TreeOptions};

const RECORD_TYPE: u32 = 1;

fn small_options() -> TreeOptions {
    TreeOptions {
        page_size: 128,
        branching_factor: 4,
        schema: vec![FieldKind::Varchar],
        max_pages: 512,
        frame_count: 16,
    }
}

fn small_tree(path: &Path) -> BPTree {
    BPTree::create(path, small_options()).expect("create tree")
}

fn rec(payload: &str) -> Record {
    Record::new(RECORD_TYPE, payload.as_bytes().to_vec())
}

fn assert_found(tree: &BPTree, key: i32, payload: &str) {
    let got = tree.search(key).expect("search").expect("key present");
    assert_eq!(got.payload, payload.as_bytes(), "payload for key {key}");
    assert_eq!(got.type_tag, RECORD_TYPE);
}

#[test]
fn insert_update_delete_roundtrip() {
    let dir = tempdir().unwrap();
    let mut tree = small_tree(&dir.path().join("t1.db"));

    tree.insert(102, &rec("sdn")).unwrap();
    tree.update(102, &rec("tuz")).unwrap();
    tree.insert(103, &rec("zzzhk")).unwrap();
    tree.update(102, &rec("sxmm")).unwrap();
    tree.delete(103).unwrap();
    tree.verify().unwrap();

    assert_found(&tree, 102, "sxmm");
    assert_eq!(tree.search(103).unwrap(), None);
}

#[test]
fn updates_shrink_and_grow() {
    let dir = tempdir().unwrap();
    let mut tree = small_tree(&dir.path().join("t2.db"));

    tree.insert(102, &rec("mslqw")).unwrap();
    tree.insert(103, &rec("f")).unwrap();
    tree.insert(104, &rec("i")).unwrap();
    tree.update(103, &rec("yooa")).unwrap();
    tree.update(103, &rec("s")).unwrap();
    tree.verify().unwrap();

    assert_found(&tree, 102, "mslqw");
    assert_found(&tree, 103, "s");
    assert_found(&tree, 104, "i");
}

#[test]
fn root_split_after_five_inserts() {
    let dir = tempdir().unwrap();
    let mut tree = small_tree(&dir.path().join("t3.db"));

    let payloads = ["aaaa", "bbbb", "cccc", "dddd", "eeee"];
    for (i, payload) in payloads.iter().enumerate() {
        tree.insert(101 + i as i32, &rec(payload)).unwrap();
        tree.verify().unwrap();
    }

    assert_eq!(tree.depth().unwrap(), 3);
    for (i, payload) in payloads.iter().enumerate() {
        assert_found(&tree, 101 + i as i32, payload);
    }
}

#[test]
fn mixed_workload_keeps_final_state() {
    let dir = tempdir().unwrap();
    let mut tree = small_tree(&dir.path().join("t4.db"));

    tree.insert(101, &rec("cxmtvdrlofv")).unwrap();
    tree.delete(101).unwrap();
    tree.insert(102, &rec("jpcahufqt")).unwrap();
    tree.insert(103, &rec("yksnstsfsyqzn")).unwrap();
    tree.insert(104, &rec("sbihfamz")).unwrap();
    tree.update(103, &rec("tao")).unwrap();
    tree.update(102, &rec("qqkr")).unwrap();
    tree.delete(103).unwrap();
    tree.update(104, &rec("girvuzvmmjjrm")).unwrap();
    tree.insert(105, &rec("swxkwtwzgmfdto")).unwrap();
    tree.delete(104).unwrap();
    tree.insert(106, &rec("ueldmisijldqodz")).unwrap();
    tree.insert(107, &rec("yhhocufx")).unwrap();
    tree.verify().unwrap();

    assert_found(&tree, 102, "qqkr");
    assert_found(&tree, 105, "swxkwtwzgmfdto");
    assert_found(&tree, 106, "ueldmisijldqodz");
    assert_found(&tree, 107, "yhhocufx");
    for gone in [101, 103, 104] {
        assert_eq!(tree.search(gone).unwrap(), None, "key {gone} should be gone");
    }
}

#[test]
fn duplicate_insert_and_missing_key_errors() {
    let dir = tempdir().unwrap();
    let mut tree = small_tree(&dir.path().join("t5.db"));

    tree.insert(7, &rec("abc")).unwrap();
    assert!(matches!(
        tree.insert(7, &rec("xyz")),
        Err(StoreError::DuplicateKey(7))
    ));
    assert!(matches!(
        tree.update(8, &rec("xyz")),
        Err(StoreError::KeyNotFound(8))
    ));
    tree.delete(7).unwrap();
    assert!(matches!(tree.delete(7), Err(StoreError::KeyNotFound(7))));
    assert_eq!(tree.search(7).unwrap(), None);
}

#[test]
fn reopen_preserves_tree() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reopen.db");
    {
        let mut tree = small_tree(&path);
        for key in 0..12 {
            tree.insert(key, &rec(&format!("value-{key}"))).unwrap();
        }
        tree.delete(5).unwrap();
    }

    let mut tree = BPTree::open(&path).unwrap();
    tree.verify().unwrap();
    assert_eq!(tree.header().branching_factor, 4);
    assert_eq!(tree.header().schema, vec![FieldKind::Varchar]);
    for key in 0..12 {
        if key == 5 {
            assert_eq!(tree.search(key).unwrap(), None);
        } else {
            assert_found(&tree, key, &format!("value-{key}"));
        }
    }
    // The reopened tree keeps working.
    tree.insert(100, &rec("after-reopen")).unwrap();
    tree.update(3, &rec("rewritten")).unwrap();
    tree.verify().unwrap();
    assert_found(&tree, 100, "after-reopen");
    assert_found(&tree, 3, "rewritten");
}

#[test]
fn random_ops_match_reference_model() {
    let dir = tempdir().unwrap();
    let mut tree = small_tree(&dir.path().join("random.db"));
    let mut reference: BTreeMap<i32, Vec<u8>> = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0xB7EE);

    for step in 0..400 {
        let key = rng.gen_range(0..48);
        let len = rng.gen_range(1..15);
        let payload: Vec<u8> = (0..len).map(|_| rng.gen_range(b'a'..=b'z')).collect();
        match rng.gen_range(0..3) {
            0 => {
                let result = tree.insert(key, &Record::new(RECORD_TYPE, payload.clone()));
                if reference.contains_key(&key) {
                    assert!(
                        matches!(result, Err(StoreError::DuplicateKey(_))),
                        "step {step}: duplicate insert must fail"
                    );
                } else {
                    result.unwrap_or_else(|err| panic!("step {step}: insert failed: {err}"));
                    reference.insert(key, payload);
                }
            }
            1 => {
                let result = tree.update(key, &Record::new(RECORD_TYPE, payload.clone()));
                if reference.contains_key(&key) {
                    result.unwrap_or_else(|err| panic!("step {step}: update failed: {err}"));
                    reference.insert(key, payload);
                } else {
                    assert!(
                        matches!(result, Err(StoreError::KeyNotFound(_))),
                        "step {step}: update of a missing key must fail"
                    );
                }
            }
            _ => {
                let result = tree.delete(key);
                if reference.contains_key(&key) {
                    result.unwrap_or_else(|err| panic!("step {step}: delete failed: {err}"));
                    reference.remove(&key);
                } else {
                    assert!(
                        matches!(result, Err(StoreError::KeyNotFound(_))),
                        "step {step}: delete of a missing key must fail"
                    );
                }
            }
        }
        tree.verify()
            .unwrap_or_else(|err| panic!("step {step}: invariant violated: {err}"));
        for probe in 0..48 {
            let got = tree.search(probe).unwrap().map(|record| record.payload);
            assert_eq!(
                got.as_deref(),
                reference.get(&probe).map(|payload| payload.as_slice()),
                "step {step}: key {probe} disagrees with the reference"
            );
        }
    }
}
