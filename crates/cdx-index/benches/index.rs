use cdx_core::config::IndexBackendKind;
use cdx_core::{DocumentId, Token};
use cdx_crypto::SecretKey;
use cdx_index::{BackendOptions, IndexStore};

const KINDS: [IndexBackendKind; 2] = [IndexBackendKind::Log, IndexBackendKind::Table];

fn token(i: u32) -> Token {
    let mut bytes = [0u8; 32];
    bytes[..4].copy_from_slice(&i.to_be_bytes());
    bytes[4..8].copy_from_slice(&i.wrapping_mul(2654435761).to_be_bytes());
    Token::from_bytes(bytes)
}

fn seeded(kind: IndexBackendKind, n: u32) -> (tempfile::TempDir, IndexStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = IndexStore::open(kind, dir.path(), 64, BackendOptions::default()).unwrap();
    let key = SecretKey::from_bytes([0x42; 32]);
    let doc = DocumentId::generate();
    for i in 0..n {
        store.insert(&key, token(i), &doc).unwrap();
    }
    (dir, store)
}

#[divan::bench(args = KINDS)]
fn bench_insert(bencher: divan::Bencher, kind: IndexBackendKind) {
    let (_dir, store) = seeded(kind, 200);
    let key = SecretKey::from_bytes([0x42; 32]);
    let mut i = 10_000u32;
    bencher.bench_local(|| {
        i += 1;
        store.insert(&key, token(i), &DocumentId::generate()).unwrap();
    });
}

#[divan::bench(args = KINDS)]
fn bench_lookup(bencher: divan::Bencher, kind: IndexBackendKind) {
    let (_dir, store) = seeded(kind, 500);
    let key = SecretKey::from_bytes([0x42; 32]);
    let wanted = token(250);
    bencher.bench_local(|| store.lookup(&key, divan::black_box(&wanted)).unwrap());
}

fn main() {
    divan::main();
}
