#![no_main]

use libfuzzer_sys::fuzz_target;
use proxyhop::{ExclusionList, MatchMode};

fuzz_target!(|data: &[u8]| {
    let input = match std::str::from_utf8(data) {
        Ok(s) => s,
        Err(_) => return,
    };

    // First line is the no_proxy list, the rest is the host
    let (csv, host) = input.split_once('\n').unwrap_or((input, ""));

    let substring = ExclusionList::parse(csv);
    let required = substring.is_proxy_required(host);
    if substring.matching_pattern(host).is_some() {
        assert!(!required);
    }

    let suffix = ExclusionList::new(ExclusionList::split(csv), MatchMode::Suffix);
    assert_eq!(
        suffix.is_proxy_required(host),
        suffix.matching_pattern(host).is_none()
    );
});
