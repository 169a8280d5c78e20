use cdx_core::DocumentId;
use cdx_crypto::{
    encrypt_document, exact_token, extract_keywords, forward_token, ngram_tokens, SecretKey,
};

fn make_text(words: usize) -> String {
    (0..words)
        .map(|i| format!("word{}", i.wrapping_mul(7919) % 5000))
        .collect::<Vec<_>>()
        .join(" ")
}

#[divan::bench]
fn bench_exact_token(bencher: divan::Bencher) {
    let key = SecretKey::from_bytes([0xAB; 32]);
    bencher.bench(|| exact_token(divan::black_box(&key), divan::black_box("invoice")));
}

#[divan::bench(args = [0, 16, 256])]
fn bench_forward_token(bencher: divan::Bencher, counter: u64) {
    let key = SecretKey::from_bytes([0xAB; 32]);
    bencher.bench(|| forward_token(&key, divan::black_box("invoice"), counter));
}

#[divan::bench(args = [2, 3, 4])]
fn bench_ngram_tokens(bencher: divan::Bencher, n: usize) {
    let key = SecretKey::from_bytes([0xAB; 32]);
    bencher.bench(|| ngram_tokens(&key, divan::black_box("internationalization"), n));
}

#[divan::bench(args = [100, 1000, 10000])]
fn bench_extract_keywords(bencher: divan::Bencher, words: usize) {
    let text = make_text(words);
    bencher
        .counter(divan::counter::BytesCount::new(text.len()))
        .bench(|| extract_keywords(divan::black_box(&text)));
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_encrypt_document(bencher: divan::Bencher, size: usize) {
    let key = SecretKey::from_bytes([0xCD; 32]);
    let id = DocumentId::generate();
    let data = vec![0x5Au8; size];
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| encrypt_document(&key, &id, divan::black_box(&data)).unwrap());
}

fn main() {
    divan::main();
}
