// The shipped sample configuration must stay loadable
use echoes::config::{HashKey, LoadBalanceStrategy, load_config};

#[test]
fn test_sample_config_loads() {
    let config = load_config("resources/echoes.yaml").unwrap();

    assert_eq!(config.vhosts.len(), 3);
    assert_eq!(config.http_listen_addr.as_deref(), Some("0.0.0.0:80"));
    assert_eq!(
        config.tls_domains(),
        vec!["www.example.com", "example.com", "api.example.com"]
    );

    let www = &config.vhosts[0];
    assert_eq!(www.load_balance, LoadBalanceStrategy::WeightedRoundRobin);
    assert_eq!(www.max_timeout, 10);
    assert_eq!(www.upstreams[0].weight, 3);

    let api = &config.vhosts[1];
    assert_eq!(api.load_balance, LoadBalanceStrategy::Hash);
    assert_eq!(api.hash_key, HashKey::ClientIp);
    assert_eq!(api.max_timeout, 30);

    let static_host = &config.vhosts[2];
    assert!(!static_host.enable_https);
    assert_eq!(static_host.upstreams[0].scheme, "https");
    assert_eq!(static_host.upstreams[0].authority(), "cdn-origin.internal");
}
