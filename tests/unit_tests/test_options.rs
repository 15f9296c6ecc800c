// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyconnect_client_rs::models::options::OptionSet;

fn gateway_response() -> OptionSet {
    let mut opts = OptionSet::new();
    opts.push("X-CSTP-Version", "1");
    opts.push("X-CSTP-Address", "10.20.0.5");
    opts.push("X-CSTP-DNS", "10.20.0.1");
    opts.push("X-CSTP-DNS", "10.20.0.2");
    opts.push("X-CSTP-MTU", "1406");
    opts.push("X-CSTP-Unknown-Extension", "whatever");
    opts
}

#[test]
fn test_insertion_order_is_retained() {
    let opts = gateway_response();
    let names: Vec<&str> = opts.iter().map(|o| o.option.as_str()).collect();
    assert_eq!(names, vec![
        "X-CSTP-Version",
        "X-CSTP-Address",
        "X-CSTP-DNS",
        "X-CSTP-DNS",
        "X-CSTP-MTU",
        "X-CSTP-Unknown-Extension",
    ]);
}

#[test]
fn test_lookup_is_case_insensitive_first_match() {
    let opts = gateway_response();
    assert_eq!(opts.get("x-cstp-address"), Some("10.20.0.5"));
    assert_eq!(opts.get("X-CSTP-DNS"), Some("10.20.0.1"));
    assert_eq!(opts.get("X-CSTP-Missing"), None);
}

#[test]
fn test_repeatable_options_keep_every_value() {
    let opts = gateway_response();
    let dns: Vec<&str> = opts.get_all("X-CSTP-DNS").collect();
    assert_eq!(dns, vec!["10.20.0.1", "10.20.0.2"]);
}

#[test]
fn test_unknown_options_are_retained_verbatim() {
    let opts = gateway_response();
    assert_eq!(opts.get("X-CSTP-Unknown-Extension"), Some("whatever"));
}

#[test]
fn test_parsed_lookup() {
    let opts = gateway_response();
    assert_eq!(opts.get_parsed::<u16>("X-CSTP-MTU"), Some(1406));
    assert_eq!(opts.get_parsed::<u16>("X-CSTP-Address"), None);
}

#[test]
fn test_clear_for_reconnect() {
    let mut opts = gateway_response();
    assert!(!opts.is_empty());
    opts.clear();
    assert!(opts.is_empty());
    assert_eq!(opts.len(), 0);
}
