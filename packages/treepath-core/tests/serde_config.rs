#[cfg(feature = "serde")]
#[test]
fn tree_config_json_roundtrips() {
    use treepath_core::{PathRefresh, TreeConfig};

    let config = TreeConfig::default()
        .with_position_attribute("sort_order")
        .with_delimiter("/")
        .with_path_refresh(PathRefresh::Always);

    let json = serde_json::to_string(&config).expect("serialize TreeConfig");
    assert!(
        json.contains("\"path_refresh\":\"always\""),
        "expected snake_case refresh policy, got: {json}"
    );

    let roundtrip = TreeConfig::from_json_str(&json).expect("deserialize TreeConfig");
    assert_eq!(roundtrip, config);
}

#[cfg(feature = "serde")]
#[test]
fn tree_config_json_is_validated() {
    use treepath_core::{Error, TreeConfig};

    assert!(matches!(
        TreeConfig::from_json_str(r#"{"delimiter":""}"#),
        Err(Error::MissingAttribute(_))
    ));
}
