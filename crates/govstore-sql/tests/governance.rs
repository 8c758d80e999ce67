//! Governance hierarchy: ownership, cascades and expansion

mod common;

use common::{open_store, provider_set};
use govstore_core::Error;
use govstore_core::model::{Budget, Customer, Expand, RateLimit, Team, VirtualKey};
use govstore_sql::ConfigStore;

fn rate_limit(id: &str) -> RateLimit {
    let mut limit = RateLimit::new(id, "1m");
    limit.request_max_limit = Some(100);
    limit
}

/// Virtual key `vk1` owning budget `b1` and rate limit `r1`, attached to k1
async fn create_governed_key(store: &ConfigStore) {
    let mut tx = store.begin_transaction().await.unwrap();
    store
        .create_budget(Some(&mut tx), Budget::new("b1", 50.0, "30d"))
        .await
        .unwrap();
    store
        .create_rate_limit(Some(&mut tx), rate_limit("r1"))
        .await
        .unwrap();

    let mut vk = VirtualKey::new("vk1", "Production");
    vk.budget_id = Some("b1".to_string());
    vk.rate_limit_id = Some("r1".to_string());
    vk.key_ids = vec!["k1".to_string()];
    store.create_virtual_key(Some(&mut tx), vk).await.unwrap();
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn test_virtual_key_with_owned_budget_and_rate_limit() {
    let (_dir, store) = open_store().await;
    store.update_providers(None, provider_set()).await.unwrap();
    create_governed_key(&store).await;

    let record = store.get_virtual_key("vk1", Expand::ALL).await.unwrap();
    assert_eq!(record.virtual_key.name, "Production");
    assert_eq!(record.budget.as_ref().unwrap().max_limit, 50.0);
    assert_eq!(record.rate_limit.as_ref().unwrap().request_max_limit, Some(100));
    assert_eq!(record.keys.len(), 1);
    assert_eq!(record.keys[0].key_id, "k1");

    let bare = store.get_virtual_key("vk1", Expand::NONE).await.unwrap();
    assert!(bare.budget.is_none());
    assert!(bare.keys.is_empty());
    assert_eq!(bare.virtual_key.key_ids, vec!["k1".to_string()]);
}

#[tokio::test]
async fn test_orphan_budget_fails_commit() {
    let (_dir, store) = open_store().await;

    let err = store
        .create_budget(None, Budget::new("lonely", 10.0, "1d"))
        .await
        .unwrap_err();
    assert!(err.is_conflict(), "unexpected error: {}", err);

    // Rolled back
    assert!(store.get_budgets().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_shared_budget_fails_commit() {
    let (_dir, store) = open_store().await;
    store.update_providers(None, provider_set()).await.unwrap();
    create_governed_key(&store).await;

    let mut team = Team::new("t1", "Platform");
    team.budget_id = Some("b1".to_string());
    let err = store.create_team(None, team).await.unwrap_err();
    assert!(err.is_conflict());
    assert!(store.get_team("t1", Expand::NONE).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_shared_rate_limit_fails_commit() {
    let (_dir, store) = open_store().await;
    store.update_providers(None, provider_set()).await.unwrap();
    create_governed_key(&store).await;

    let mut vk = VirtualKey::new("vk2", "Staging");
    vk.rate_limit_id = Some("r1".to_string());
    let err = store.create_virtual_key(None, vk).await.unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn test_delete_virtual_key_drops_owned_rows() {
    let (_dir, store) = open_store().await;
    store.update_providers(None, provider_set()).await.unwrap();
    create_governed_key(&store).await;

    store.delete_virtual_key(None, "vk1").await.unwrap();

    assert!(store.get_budget("b1").await.unwrap_err().is_not_found());
    assert!(store.get_rate_limit("r1").await.unwrap_err().is_not_found());
    // Provider keys stay
    assert_eq!(store.get_keys_by_ids(&["k1".to_string()]).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_replacing_budget_deletes_previous() {
    let (_dir, store) = open_store().await;
    store.update_providers(None, provider_set()).await.unwrap();
    create_governed_key(&store).await;

    let mut vk = store
        .get_virtual_key("vk1", Expand::NONE)
        .await
        .unwrap()
        .virtual_key;

    let mut tx = store.begin_transaction().await.unwrap();
    store
        .create_budget(Some(&mut tx), Budget::new("b2", 500.0, "1M"))
        .await
        .unwrap();
    vk.budget_id = Some("b2".to_string());
    vk.key_ids = vec!["k2".to_string(), "k3".to_string()];
    store.update_virtual_key(Some(&mut tx), vk).await.unwrap();
    tx.commit().await.unwrap();

    let budgets = store.get_budgets().await.unwrap();
    assert_eq!(budgets.len(), 1);
    assert_eq!(budgets[0].id, "b2");

    let record = store.get_virtual_key("vk1", Expand::ALL).await.unwrap();
    let keys: Vec<_> = record.keys.iter().map(|k| k.key_id.as_str()).collect();
    assert_eq!(keys, vec!["k2", "k3"]);
    assert_eq!(
        record.virtual_key.key_ids,
        vec!["k2".to_string(), "k3".to_string()]
    );
}

#[tokio::test]
async fn test_key_ids_keep_submission_order() {
    let (_dir, store) = open_store().await;
    store.update_providers(None, provider_set()).await.unwrap();

    // k3 has the lowest row id: anthropic is written before openai
    let mut vk = VirtualKey::new("vk-ordered", "Ordered");
    vk.key_ids = vec!["k2".to_string(), "k3".to_string(), "k1".to_string()];
    store.create_virtual_key(None, vk).await.unwrap();

    let record = store.get_virtual_key("vk-ordered", Expand::ALL).await.unwrap();
    assert_eq!(
        record.virtual_key.key_ids,
        vec!["k2".to_string(), "k3".to_string(), "k1".to_string()]
    );
    let keys: Vec<_> = record.keys.iter().map(|k| k.key_id.as_str()).collect();
    assert_eq!(keys, vec!["k2", "k3", "k1"]);
}

#[tokio::test]
async fn test_budget_moves_from_team_to_customer() {
    let (_dir, store) = open_store().await;

    let mut tx = store.begin_transaction().await.unwrap();
    store
        .create_budget(Some(&mut tx), Budget::new("b1", 200.0, "1M"))
        .await
        .unwrap();
    let mut team = Team::new("t1", "Platform");
    team.budget_id = Some("b1".to_string());
    store.create_team(Some(&mut tx), team).await.unwrap();
    store
        .create_customer(Some(&mut tx), Customer::new("c1", "Acme"))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut customer = store.get_customer("c1", Expand::NONE).await.unwrap().customer;
    let mut team = store.get_team("t1", Expand::NONE).await.unwrap().team;

    let mut tx = store.begin_transaction().await.unwrap();
    customer.budget_id = Some("b1".to_string());
    store.update_customer(Some(&mut tx), customer).await.unwrap();
    team.budget_id = None;
    store.update_team(Some(&mut tx), team).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(store.get_budget("b1").await.unwrap().max_limit, 200.0);
    let customer = store.get_customer("c1", Expand::ALL).await.unwrap();
    assert_eq!(customer.customer.budget_id.as_deref(), Some("b1"));
    assert_eq!(customer.budget.unwrap().id, "b1");
    let team = store.get_team("t1", Expand::NONE).await.unwrap();
    assert!(team.team.budget_id.is_none());
}

#[tokio::test]
async fn test_released_budget_is_deleted_when_nobody_takes_it() {
    let (_dir, store) = open_store().await;

    let mut tx = store.begin_transaction().await.unwrap();
    store
        .create_budget(Some(&mut tx), Budget::new("b1", 200.0, "1M"))
        .await
        .unwrap();
    let mut team = Team::new("t1", "Platform");
    team.budget_id = Some("b1".to_string());
    store.create_team(Some(&mut tx), team.clone()).await.unwrap();
    tx.commit().await.unwrap();

    team.budget_id = None;
    store.update_team(None, team).await.unwrap();
    assert!(store.get_budget("b1").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_rate_limit_moves_between_virtual_keys() {
    let (_dir, store) = open_store().await;
    store.update_providers(None, provider_set()).await.unwrap();
    create_governed_key(&store).await;
    store
        .create_virtual_key(None, VirtualKey::new("vk2", "Staging"))
        .await
        .unwrap();

    let mut first = store.get_virtual_key("vk1", Expand::NONE).await.unwrap().virtual_key;
    let mut second = store.get_virtual_key("vk2", Expand::NONE).await.unwrap().virtual_key;

    let mut tx = store.begin_transaction().await.unwrap();
    second.rate_limit_id = Some("r1".to_string());
    store.update_virtual_key(Some(&mut tx), second).await.unwrap();
    first.rate_limit_id = None;
    store.update_virtual_key(Some(&mut tx), first).await.unwrap();
    tx.commit().await.unwrap();

    let moved = store.get_virtual_key("vk2", Expand::ALL).await.unwrap();
    assert_eq!(moved.rate_limit.unwrap().request_max_limit, Some(100));
    let left = store.get_virtual_key("vk1", Expand::ALL).await.unwrap();
    assert!(left.rate_limit.is_none());
    assert_eq!(left.budget.unwrap().id, "b1");
}

#[tokio::test]
async fn test_unknown_references_are_not_found() {
    let (_dir, store) = open_store().await;
    store.update_providers(None, provider_set()).await.unwrap();

    let mut vk = VirtualKey::new("vk1", "Ghost team");
    vk.team_id = Some("missing".to_string());
    assert!(store.create_virtual_key(None, vk).await.unwrap_err().is_not_found());

    let mut vk = VirtualKey::new("vk1", "Ghost key");
    vk.key_ids = vec!["nope".to_string()];
    assert!(store.create_virtual_key(None, vk).await.unwrap_err().is_not_found());

    let mut team = Team::new("t1", "Orphan");
    team.customer_id = Some("missing".to_string());
    assert!(store.create_team(None, team).await.unwrap_err().is_not_found());

    assert!(store.get_virtual_keys(Expand::NONE).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_team_and_customer_exclusive() {
    let (_dir, store) = open_store().await;

    let mut vk = VirtualKey::new("vk1", "Both");
    vk.team_id = Some("t1".to_string());
    vk.customer_id = Some("c1".to_string());
    let err = store.create_virtual_key(None, vk).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_customer_hierarchy() {
    let (_dir, store) = open_store().await;

    let mut tx = store.begin_transaction().await.unwrap();
    store
        .create_budget(Some(&mut tx), Budget::new("cb", 1000.0, "1M"))
        .await
        .unwrap();
    let mut customer = Customer::new("c1", "Acme");
    customer.budget_id = Some("cb".to_string());
    store.create_customer(Some(&mut tx), customer).await.unwrap();

    for (id, name) in [("t1", "Research"), ("t2", "Sales")] {
        let mut team = Team::new(id, name);
        team.customer_id = Some("c1".to_string());
        store.create_team(Some(&mut tx), team).await.unwrap();
    }
    store
        .create_team(Some(&mut tx), Team::new("t3", "Independent"))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let customer = store.get_customer("c1", Expand::ALL).await.unwrap();
    assert_eq!(customer.teams.len(), 2);
    assert_eq!(customer.budget.unwrap().id, "cb");

    let acme_teams = store.get_teams(Some("c1"), Expand::ALL).await.unwrap();
    assert_eq!(acme_teams.len(), 2);
    assert!(
        acme_teams
            .iter()
            .all(|t| t.customer.as_ref().map(|c| c.id.as_str()) == Some("c1"))
    );
    assert_eq!(store.get_teams(None, Expand::NONE).await.unwrap().len(), 3);

    // Teams are detached, the owned budget goes with the customer
    store.delete_customer(None, "c1").await.unwrap();
    let teams = store.get_teams(None, Expand::NONE).await.unwrap();
    assert_eq!(teams.len(), 3);
    assert!(teams.iter().all(|t| t.team.customer_id.is_none()));
    assert!(store.get_budget("cb").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_batch_budget_update_is_atomic() {
    let (_dir, store) = open_store().await;
    store.update_providers(None, provider_set()).await.unwrap();
    create_governed_key(&store).await;

    let mut used = store.get_budget("b1").await.unwrap();
    used.current_usage = 12.5;
    let missing = Budget::new("missing", 1.0, "1d");

    let err = store
        .update_budgets(None, vec![used.clone(), missing])
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(store.get_budget("b1").await.unwrap().current_usage, 0.0);

    store.update_budgets(None, vec![used]).await.unwrap();
    assert_eq!(store.get_budget("b1").await.unwrap().current_usage, 12.5);
}

#[tokio::test]
async fn test_rate_limit_batch_update() {
    let (_dir, store) = open_store().await;
    store.update_providers(None, provider_set()).await.unwrap();
    create_governed_key(&store).await;

    let mut limit = store.get_rate_limit("r1").await.unwrap();
    limit.request_current_usage = 42;
    store.update_rate_limits(None, vec![limit]).await.unwrap();
    assert_eq!(
        store.get_rate_limit("r1").await.unwrap().request_current_usage,
        42
    );

    let mut limit = rate_limit("r1");
    limit.token_max_limit = Some(10_000);
    store.update_rate_limit(None, limit).await.unwrap();
    assert_eq!(
        store.get_rate_limit("r1").await.unwrap().token_max_limit,
        Some(10_000)
    );
}

#[tokio::test]
async fn test_delete_owned_rate_limit_detaches_it() {
    let (_dir, store) = open_store().await;
    store.update_providers(None, provider_set()).await.unwrap();
    create_governed_key(&store).await;

    store.delete_rate_limit(None, "r1").await.unwrap();
    let vk = store.get_virtual_key("vk1", Expand::NONE).await.unwrap();
    assert!(vk.virtual_key.rate_limit_id.is_none());

    store.delete_budget(None, "b1").await.unwrap();
    assert!(store.delete_budget(None, "b1").await.unwrap_err().is_not_found());
}
