mod common;

use common::{file_engine, TestEngine};
use dynamic_entities::{AppError, CrudService, EngineError, FieldType, NewEntity, NewField, OnDeleteAction};
use serde_json::{json, Map, Value};

fn body(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

/// Customer, Tag and Purchase (customer reference plus many tags), all materialized.
async fn shop() -> TestEngine {
    let t = file_engine().await;
    let customer = t
        .define(
            NewEntity::new("Customer")
                .field(NewField::new("name", FieldType::ShortText).required())
                .field(NewField::new("email", FieldType::Email).unique()),
        )
        .await;
    let tag = t
        .define(NewEntity::new("Tag").field(NewField::new("label", FieldType::ShortText).param("max_length", 12)))
        .await;
    let purchase = t
        .define(
            NewEntity::new("Purchase")
                .field(
                    NewField::new("customer", FieldType::ReferenceOne)
                        .references("Customer", OnDeleteAction::Protect)
                        .required(),
                )
                .field(NewField::new("total", FieldType::Decimal))
                .field(NewField::new("paid", FieldType::Boolean).default_value("false"))
                .field(NewField::new("placed_on", FieldType::Date))
                .field(NewField::new("tags", FieldType::ReferenceMany).references("Tag", OnDeleteAction::Cascade)),
        )
        .await;
    for def in [customer, tag, purchase] {
        let outcome = t.engine.admin.create_entity_table(def.id).await;
        assert!(outcome.success, "{}", outcome.message);
    }
    t
}

#[tokio::test]
async fn create_read_update_delete_with_relations() {
    let t = shop().await;
    let pool = t.engine.storage.pool();
    let customers = t.engine.registry.accessor("Customer").unwrap();
    let tags = t.engine.registry.accessor("Tag").unwrap();
    let purchases = t.engine.registry.accessor("Purchase").unwrap();

    let ada = CrudService::create(&pool, &customers, &body(json!({"name": "Ada", "email": "ada@example.com"})))
        .await
        .unwrap();
    let ada_id = ada["id"].as_i64().unwrap();
    let a = CrudService::create(&pool, &tags, &body(json!({"label": "gift"}))).await.unwrap();
    let b = CrudService::create(&pool, &tags, &body(json!({"label": "rush"}))).await.unwrap();

    let created = CrudService::create(
        &pool,
        &purchases,
        &body(json!({
            "customer": ada_id,
            "total": "19.99",
            "placed_on": "2024-05-01",
            "tags": [b["id"], a["id"]]
        })),
    )
    .await
    .unwrap();
    let id = created["id"].as_i64().unwrap();
    assert_eq!(created["customer_id"], json!(ada_id));
    assert_eq!(created["total"], json!(19.99));
    assert_eq!(created["paid"], json!(false));
    assert_eq!(created["placed_on"], json!("2024-05-01"));
    assert_eq!(created["tags"], json!([a["id"], b["id"]]));

    let updated = CrudService::update(&pool, &purchases, id, &body(json!({"paid": true, "tags": [a["id"]]})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated["paid"], json!(true));
    assert_eq!(updated["total"], json!(19.99));
    assert_eq!(updated["tags"], json!([a["id"]]));

    let fetched = CrudService::get(&pool, &purchases, id).await.unwrap().unwrap();
    assert_eq!(fetched, updated);

    let deleted = CrudService::delete(&pool, &purchases, id).await.unwrap().unwrap();
    assert_eq!(deleted["id"], json!(id));
    assert!(CrudService::get(&pool, &purchases, id).await.unwrap().is_none());
    let links: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM purchase_tags")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(links, 0);
    assert!(CrudService::delete(&pool, &purchases, id).await.unwrap().is_none());
}

#[tokio::test]
async fn list_filters_limits_and_offsets() {
    let t = shop().await;
    let pool = t.engine.storage.pool();
    let tags = t.engine.registry.accessor("Tag").unwrap();
    for label in ["a", "b", "c", "b"] {
        CrudService::create(&pool, &tags, &body(json!({ "label": label }))).await.unwrap();
    }

    let all = CrudService::list(&pool, &tags, &[], None, None).await.unwrap();
    assert_eq!(all.len(), 4);

    let bs = CrudService::list(&pool, &tags, &[("label".into(), "b".into())], None, None)
        .await
        .unwrap();
    assert_eq!(bs.len(), 2);

    let page = CrudService::list(&pool, &tags, &[], Some(2), Some(1)).await.unwrap();
    let labels: Vec<&str> = page.iter().map(|r| r["label"].as_str().unwrap()).collect();
    assert_eq!(labels, vec!["b", "c"]);

    let none = CrudService::list(&pool, &tags, &[("label".into(), "null".into())], None, None)
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn invalid_input_is_a_validation_error() {
    let t = shop().await;
    let pool = t.engine.storage.pool();
    let customers = t.engine.registry.accessor("Customer").unwrap();
    let tags = t.engine.registry.accessor("Tag").unwrap();
    let purchases = t.engine.registry.accessor("Purchase").unwrap();

    let missing = CrudService::create(&pool, &customers, &body(json!({"email": "x@y.io"}))).await;
    assert!(matches!(missing, Err(AppError::Validation(_))));

    let bad_email = CrudService::create(&pool, &customers, &body(json!({"name": "X", "email": "nope"}))).await;
    assert!(matches!(bad_email, Err(AppError::Validation(_))));

    let too_long = CrudService::create(&pool, &tags, &body(json!({"label": "much-too-long-label"}))).await;
    assert!(matches!(too_long, Err(AppError::Validation(_))));

    let no_customer = CrudService::create(&pool, &purchases, &body(json!({"customer_id": 404}))).await;
    assert!(matches!(no_customer, Err(AppError::Validation(_))), "{:?}", no_customer.err());

    CrudService::create(&pool, &customers, &body(json!({"name": "A", "email": "a@b.io"})))
        .await
        .unwrap();
    let duplicate = CrudService::create(&pool, &customers, &body(json!({"name": "B", "email": "a@b.io"}))).await;
    assert!(matches!(duplicate, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn protected_reference_blocks_delete() {
    let t = shop().await;
    let pool = t.engine.storage.pool();
    let customers = t.engine.registry.accessor("Customer").unwrap();
    let purchases = t.engine.registry.accessor("Purchase").unwrap();
    let ada = CrudService::create(&pool, &customers, &body(json!({"name": "Ada"}))).await.unwrap();
    CrudService::create(&pool, &purchases, &body(json!({"customer_id": ada["id"]})))
        .await
        .unwrap();

    let err = CrudService::delete(&pool, &customers, ada["id"].as_i64().unwrap()).await;
    assert!(matches!(err, Err(AppError::Validation(_))));
    assert!(CrudService::get(&pool, &customers, ada["id"].as_i64().unwrap())
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn duplicate_definitions_are_rejected() {
    let t = file_engine().await;
    t.define(NewEntity::new("Customer")).await;

    let err = t.engine.definitions.create_entity(NewEntity::new("Customer")).await.unwrap_err();
    assert!(matches!(err, EngineError::DefinitionValidation(_)));

    let dup_fields = NewEntity::new("Order")
        .field(NewField::new("code", FieldType::ShortText))
        .field(NewField::new("code", FieldType::Integer));
    let err = t.engine.definitions.create_entity(dup_fields).await.unwrap_err();
    assert!(matches!(err, EngineError::DefinitionValidation(_)));

    let reserved = NewEntity::new("Thing").field(NewField::new("id", FieldType::Integer));
    assert!(t.engine.definitions.create_entity(reserved).await.is_err());
    assert_eq!(t.engine.definitions.list_entities().await.unwrap().len(), 1);
}
