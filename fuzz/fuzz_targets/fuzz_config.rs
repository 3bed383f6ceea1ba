#![no_main]

use libfuzzer_sys::fuzz_target;
use proxyhop::{Config, ProxySettings, Scheme};

fuzz_target!(|data: &[u8]| {
    let input = match std::str::from_utf8(data) {
        Ok(s) => s,
        Err(_) => return,
    };

    // Parse errors are fine; anything that parses must resolve without panicking
    let Ok(config) = Config::parse(input) else {
        return;
    };
    let settings = ProxySettings::from_config(&config);
    let _ = settings.endpoint(Scheme::Http);
    let _ = settings.endpoint(Scheme::Https);
    let _ = settings.is_proxy_required("example.com");
});
