use serde_json::json;

use otdb_core::{prepare_query, Error, MemoryDb, OtDb, QueryConfig, QueryError, ReadOptions};

fn rejected(query: serde_json::Value, config: &QueryConfig) -> QueryError {
    prepare_query(&query, config).unwrap_err()
}

#[test]
fn two_collection_operations_name_both() {
    let err = rejected(
        json!({"$distinct": {"field": "x"}, "$mapReduce": {"map": "f", "reduce": "g"}}),
        &QueryConfig::default(),
    );
    assert_eq!(err.code(), 4108);
    assert_eq!(
        err,
        QueryError::OnlyOneCollectionOperation("$distinct".into(), "$mapReduce".into())
    );
    let msg = err.to_string();
    assert!(msg.contains("$distinct") && msg.contains("$mapReduce"), "{msg}");
}

#[test]
fn two_cursor_operations_name_both() {
    let err = rejected(json!({"$count": true, "$explain": true}), &QueryConfig::default());
    assert_eq!(err.code(), 4109);
    assert_eq!(err, QueryError::OnlyOneCursorOperation("$count".into(), "$explain".into()));
}

#[test]
fn collection_operation_cannot_mix_with_cursor_methods() {
    let err = rejected(
        json!({"$distinct": {"field": "x"}, "$limit": 2}),
        &QueryConfig::default(),
    );
    assert_eq!(err.code(), 4110);
    assert_eq!(err, QueryError::CursorAndCollectionMethod("$distinct".into()));
}

#[test]
fn raw_code_operators_are_disabled_by_default() {
    let config = QueryConfig::default();
    assert_eq!(rejected(json!({"$where": "this.x > 1"}), &config).code(), 4103);
    assert_eq!(
        rejected(json!({"$mapReduce": {"map": "f", "reduce": "g"}}), &config).code(),
        4104
    );

    let enabled = QueryConfig {
        allow_js_queries: true,
        ..QueryConfig::default()
    };
    // Allowed by the flag, but no backend executes raw code.
    assert_eq!(rejected(json!({"$where": "this.x > 1"}), &enabled).code(), 4111);
}

#[test]
fn aggregate_can_be_disabled() {
    let config = QueryConfig {
        allow_aggregate_queries: false,
        ..QueryConfig::default()
    };
    assert_eq!(rejected(json!({"$aggregate": [{"$match": {}}]}), &config).code(), 4105);
    assert_eq!(
        rejected(json!({"$aggregate": [{"$match": {}}]}), &QueryConfig::default()).code(),
        4111
    );
}

#[test]
fn query_wrapper_is_deprecated() {
    assert_eq!(
        rejected(json!({"$query": {"x": 1}}), &QueryConfig::default()),
        QueryError::QueryDeprecated
    );
}

#[test]
fn malformed_operators() {
    let config = QueryConfig::default();
    assert_eq!(rejected(json!({"$or": {"x": 1}}), &config).code(), 4107);
    assert_eq!(rejected(json!({"x": 1, "$limit": -1}), &config).code(), 4107);
    assert_eq!(rejected(json!({"x": {"$in": 3}}), &config).code(), 4107);
    assert_eq!(rejected(json!({"$sort": {"x": 2}}), &config).code(), 4107);
}

#[test]
fn unsupported_shapes_are_rejected_before_translation() {
    let config = QueryConfig::default();
    assert_eq!(rejected(json!({"x": {"$regex": "^a"}}), &config).code(), 4111);
    assert_eq!(rejected(json!({"x": {"$gt": null}}), &config).code(), 4111);
    assert_eq!(rejected(json!({"$text": {"$search": "a"}}), &config).code(), 4111);
    assert_eq!(rejected(json!({"x": 1, "$max": {"x": 3}}), &config).code(), 4111);
    assert_eq!(rejected(json!(["not", "an", "object"]), &config).code(), 4111);
}

#[test]
fn validation_errors_surface_through_the_backend() {
    let db = MemoryDb::new();
    let err = db
        .query(
            "docs",
            &json!({"$distinct": {"field": "x"}, "$mapReduce": {}}),
            None,
            &ReadOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Query(QueryError::OnlyOneCollectionOperation(..))));
    assert_eq!(err.code(), Some(4108));
}
