use criterion::{black_box, criterion_group, criterion_main, Criterion};
use request_guard::core::fingerprint::FingerprintBuilder;
use request_guard::core::ip::{IpResolver, TrustedProxies};
use request_guard::Request;

fn request() -> Request {
    Request::builder()
        .ip("8.8.8.8")
        .method("POST")
        .host("example.com")
        .path("/signup")
        .header("User-Agent", "Mozilla/5.0 (X11; Linux x86_64)")
        .header("X-Forwarded-For", "1.1.1.1, 10.0.0.1, 192.168.0.1")
        .header("Cookie", "session=abc123; theme=dark")
        .query("ref=newsletter")
        .extra("userId", "42")
        .build()
}

fn fingerprint_benchmark(c: &mut Criterion) {
    let request = request();

    let ip_only = FingerprintBuilder::new(&["ip.src".to_string()]).unwrap();
    c.bench_function("fingerprint_ip_src", |b| b.iter(|| ip_only.build(black_box(&request))));

    let many: Vec<String> = [
        "ip.src",
        "http.method",
        "http.request.cookie[\"session\"]",
        "http.request.headers[\"user-agent\"]",
        "http.request.uri.args[\"ref\"]",
        "userId",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let builder = FingerprintBuilder::new(&many).unwrap();
    c.bench_function("fingerprint_six_characteristics", |b| {
        b.iter(|| builder.build(black_box(&request)))
    });

    let resolver = IpResolver::new(None, TrustedProxies::default());
    let proxied = request.with_ip("");
    c.bench_function("resolve_forwarded_ip", |b| b.iter(|| resolver.resolve(black_box(&proxied))));
}

criterion_group!(benches, fingerprint_benchmark);
criterion_main!(benches);
