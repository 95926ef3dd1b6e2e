mod common;

use std::time::Duration;

use feed_engine::{
    Classification, FeedConfig, FeedError, InvalidationBus, Money, MutationKind,
    MutationOutcome, MutationStatus, RemoteError, SyncState, TransactionPatch, TxId,
};
use pretty_assertions::assert_eq;

use common::*;

fn two_feeds_remote() -> std::sync::Arc<ScriptedFeed> {
    let remote = ScriptedFeed::new();
    remote.seed(vec![
        server_tx("tx_3", Classification::Expense, 300),
        server_tx("tx_9", Classification::Income, 900),
        server_tx("tx_1", Classification::Expense, 100),
        server_tx("tx_2", Classification::Expense, 200),
    ]);
    remote
}

#[tokio::test(start_paused = true)]
async fn created_row_is_reconciled_into_its_authoritative_copy() {
    let remote = ScriptedFeed::new();
    let engine = engine(remote.clone());

    let gate = remote.gate_create();
    let create = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.create(expense(500)).await })
    };
    settle().await;

    let view = engine.observe(&all());
    assert_eq!(view.items.len(), 1);
    assert_eq!(view.items[0].amount, Money::new(500));
    assert_eq!(view.items[0].sync, SyncState::Provisional);
    let temp = view.items[0].id.as_temp().unwrap();

    settle().await;
    assert_eq!(engine.view(&all()).items.len(), 1);
    assert_eq!(engine.pending().len(), 1);

    gate.send(()).unwrap();
    let outcome = create.await.unwrap().unwrap();
    let MutationOutcome::Created {
        temp: created,
        entity,
    } = outcome
    else {
        panic!("expected a create outcome");
    };
    assert_eq!(created, temp);
    assert_eq!(entity.id, TxId::Server("tx_1".to_string()));
    assert_eq!(
        remote.idempotency_keys.lock().unwrap().clone(),
        vec![temp.to_string()]
    );

    let view = engine.view(&all());
    assert_eq!(ids(&view.items), vec![temp.to_string()]);
    assert_eq!(view.items[0].sync, SyncState::Confirmed);

    tokio::time::sleep(Duration::from_millis(1600)).await;
    settle().await;

    let view = engine.view(&all());
    assert_eq!(ids(&view.items), vec!["tx_1"]);
    assert_eq!(view.items[0].amount, Money::new(500));
    assert_eq!(view.total, 1);
}

#[tokio::test(start_paused = true)]
async fn backdated_create_is_reconciled_from_the_page_that_returns_it() {
    let remote = ScriptedFeed::new();
    let mut recent = server_tx("a", Classification::Expense, 100);
    recent.occurred_on = day(20);
    remote.seed(vec![recent.clone()]);
    let engine = engine(remote.clone());
    loaded(&engine, &all()).await;

    let MutationOutcome::Created { temp, entity } = engine.create(expense(500)).await.unwrap()
    else {
        panic!("expected a create outcome");
    };
    assert_eq!(
        ids(&engine.view(&all()).items),
        vec![temp.to_string(), "a".to_string()]
    );

    remote.push_page(vec![recent], Some("c1"));
    remote.push_page(vec![entity], None);
    tokio::time::sleep(Duration::from_millis(1600)).await;
    settle().await;

    let view = engine.view(&all());
    assert_eq!(ids(&view.items), vec!["a"]);
    assert_eq!(view.total, view.items.len() as u64);

    engine.load_more(&all()).await.unwrap();
    let view = engine.view(&all());
    assert_eq!(ids(&view.items), vec!["a", "tx_1"]);
    assert_eq!(view.items[1].amount, Money::new(500));

    let fresh = engine.observe(&expenses());
    assert!(fresh.items.iter().all(|tx| tx.id.as_temp().is_none()));
}

#[tokio::test(start_paused = true)]
async fn create_that_commits_after_logout_leaves_the_new_session_untouched() {
    let remote = ScriptedFeed::new();
    let engine = engine(remote.clone());
    loaded(&engine, &all()).await;

    let gate = remote.gate_create();
    let create = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.create(expense(500)).await })
    };
    settle().await;
    let temp = engine.view(&all()).items[0].id.clone();

    engine.on_session_cleared();
    let lists = ScriptedFeed::calls(&remote.list_calls);
    gate.send(()).unwrap();
    assert!(matches!(
        create.await.unwrap().unwrap(),
        MutationOutcome::Created { .. }
    ));

    assert!(engine.store().detail("tx_1").is_none());
    assert!(engine.store().resolve(&temp).is_none());
    assert!(engine.store().read(&all()).is_none());

    tokio::time::sleep(Duration::from_millis(2000)).await;
    settle().await;
    assert_eq!(ScriptedFeed::calls(&remote.list_calls), lists);
    assert!(engine.store().read(&all()).is_none());
}

#[tokio::test]
async fn failed_create_restores_every_feed_exactly() {
    let remote = two_feeds_remote();
    let engine = engine(remote.clone());
    loaded(&engine, &all()).await;
    loaded(&engine, &expenses()).await;
    let before = (engine.view(&all()), engine.view(&expenses()));

    let gate = remote.gate_create();
    remote.fail_create(RemoteError::Server("boom".to_string()));
    let create = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.create(expense(700)).await })
    };
    settle().await;

    for fp in [all(), expenses()] {
        assert!(engine.view(&fp).items[0].is_provisional());
    }
    assert_eq!(engine.view(&all()).total, before.0.total + 1);
    assert_eq!(engine.view(&expenses()).total, before.1.total + 1);

    gate.send(()).unwrap();
    let err = create.await.unwrap().unwrap_err();
    assert!(matches!(err, FeedError::Transport(_)));

    assert_eq!(engine.view(&all()).pages, before.0.pages);
    assert_eq!(engine.view(&all()).total, before.0.total);
    assert_eq!(engine.view(&expenses()).pages, before.1.pages);
    assert_eq!(engine.view(&expenses()).total, before.1.total);

    let recent = engine.recent();
    assert_eq!(recent.last().unwrap().kind, MutationKind::Create);
    assert_eq!(recent.last().unwrap().status, MutationStatus::RolledBack);
    assert!(engine.pending().is_empty());
}

#[tokio::test]
async fn invalid_create_never_touches_the_cache() {
    let remote = two_feeds_remote();
    let engine = engine(remote.clone());
    loaded(&engine, &all()).await;
    let before = engine.view(&all());

    let err = engine.create(expense(0)).await.unwrap_err();
    assert_eq!(err, FeedError::Validation("amount must be > 0".to_string()));
    assert_eq!(engine.view(&all()).items, before.items);
    assert_eq!(ScriptedFeed::calls(&remote.create_calls), 0);
}

#[tokio::test]
async fn failed_delete_puts_the_row_back_at_its_index_in_every_feed() {
    let remote = two_feeds_remote();
    let engine = engine(remote.clone());
    loaded(&engine, &all()).await;
    loaded(&engine, &expenses()).await;
    let before_all = engine.view(&all());
    let before_expenses = engine.view(&expenses());
    assert_eq!(ids(&before_all.items)[2], "tx_1");
    assert_eq!(ids(&before_expenses.items)[1], "tx_1");

    let gate = remote.gate_delete();
    remote.fail_delete(RemoteError::Transport("offline".to_string()));
    let delete = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.delete(TxId::Server("tx_1".to_string())).await })
    };
    settle().await;

    let gone = TxId::Server("tx_1".to_string());
    for (fp, before) in [(all(), &before_all), (expenses(), &before_expenses)] {
        let view = engine.view(&fp);
        assert!(view.items.iter().all(|tx| tx.id != gone));
        assert_eq!(view.total, before.total - 1);
    }

    gate.send(()).unwrap();
    assert_eq!(
        delete.await.unwrap().unwrap_err(),
        FeedError::Transport("offline".to_string())
    );

    let after_all = engine.view(&all());
    let after_expenses = engine.view(&expenses());
    assert_eq!(after_all.items, before_all.items);
    assert_eq!(after_all.total, before_all.total);
    assert_eq!(after_expenses.items, before_expenses.items);
    assert_eq!(after_expenses.total, before_expenses.total);

    // The tombstone is lifted with the rollback.
    engine.refresh(&all()).await.unwrap();
    assert_eq!(ids(&engine.view(&all()).items)[2], "tx_1");
}

#[tokio::test]
async fn rollback_after_a_concurrent_merge_only_undoes_the_delete() {
    let remote = ScriptedFeed::new();
    remote.seed(
        (0..4)
            .map(|n| server_tx(&format!("tx_{n}"), Classification::Expense, 100))
            .collect(),
    );
    let engine = engine_with(
        remote.clone(),
        FeedConfig {
            page_limit: 2,
            ..FeedConfig::default()
        },
    );
    loaded(&engine, &all()).await;

    let gate = remote.gate_delete();
    remote.fail_delete(RemoteError::Server("boom".to_string()));
    let delete = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.delete(TxId::Server("tx_0".to_string())).await })
    };
    settle().await;
    engine.load_more(&all()).await.unwrap();
    assert_eq!(ids(&engine.view(&all()).items), vec!["tx_1", "tx_2", "tx_3"]);

    gate.send(()).unwrap();
    assert!(delete.await.unwrap().is_err());
    assert_eq!(
        ids(&engine.view(&all()).items),
        vec!["tx_0", "tx_1", "tx_2", "tx_3"]
    );
}

#[tokio::test]
async fn delete_of_a_rolled_back_create_stays_local() {
    let remote = two_feeds_remote();
    let engine = engine(remote.clone());
    loaded(&engine, &all()).await;
    let before = engine.view(&all());

    let gate = remote.gate_create();
    remote.fail_create(RemoteError::Server("boom".to_string()));
    let create = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.create(expense(500)).await })
    };
    settle().await;
    let temp = engine.view(&all()).items[0].id.clone();
    assert!(temp.as_temp().is_some());

    let delete = {
        let engine = engine.clone();
        let temp = temp.clone();
        tokio::spawn(async move { engine.delete(temp).await })
    };
    settle().await;
    // Queued behind the create.
    assert!(!delete.is_finished());

    gate.send(()).unwrap();
    assert!(create.await.unwrap().is_err());
    assert_eq!(
        delete.await.unwrap().unwrap(),
        MutationOutcome::Deleted(temp.clone())
    );

    assert_eq!(ScriptedFeed::calls(&remote.delete_calls), 0);
    for fp in [all(), expenses()] {
        assert!(engine.view(&fp).items.iter().all(|tx| tx.id != temp));
    }
    assert_eq!(engine.view(&all()).items, before.items);
}

#[tokio::test(start_paused = true)]
async fn delete_of_a_committed_create_uses_the_authoritative_id() {
    let remote = ScriptedFeed::new();
    let engine = engine(remote.clone());
    loaded(&engine, &all()).await;

    let gate = remote.gate_create();
    let create = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.create(expense(500)).await })
    };
    settle().await;
    let temp = engine.view(&all()).items[0].id.clone();
    let delete = {
        let engine = engine.clone();
        let temp = temp.clone();
        tokio::spawn(async move { engine.delete(temp).await })
    };
    settle().await;
    assert_eq!(ScriptedFeed::calls(&remote.delete_calls), 0);

    gate.send(()).unwrap();
    create.await.unwrap().unwrap();
    delete.await.unwrap().unwrap();

    assert_eq!(ScriptedFeed::calls(&remote.delete_calls), 1);
    assert!(remote.rows().is_empty());
    assert!(engine.view(&all()).items.is_empty());

    tokio::time::sleep(Duration::from_millis(1600)).await;
    settle().await;
    assert!(engine.view(&all()).items.is_empty());
    assert_eq!(engine.view(&all()).total, 0);
}

#[tokio::test]
async fn failed_delete_of_an_unobserved_create_still_seeds_new_feeds() {
    let remote = ScriptedFeed::new();
    let engine = engine(remote.clone());
    loaded(&engine, &all()).await;

    let MutationOutcome::Created { temp, .. } = engine.create(expense(500)).await.unwrap() else {
        panic!("expected a create outcome");
    };
    remote.fail_delete(RemoteError::Server("boom".to_string()));
    engine
        .delete(TxId::Server("tx_1".to_string()))
        .await
        .unwrap_err();

    assert_eq!(ids(&engine.view(&all()).items), vec![temp.to_string()]);
    let fresh = engine.observe(&expenses());
    assert_eq!(ids(&fresh.items), vec![temp.to_string()]);
}

#[tokio::test]
async fn delete_that_the_server_already_applied_counts_as_success() {
    let remote = two_feeds_remote();
    let engine = engine(remote.clone());
    loaded(&engine, &all()).await;
    remote.seed(Vec::new());

    engine
        .delete(TxId::Server("tx_9".to_string()))
        .await
        .unwrap();
    assert!(
        engine
            .view(&all())
            .items
            .iter()
            .all(|tx| tx.id.as_server() != Some("tx_9"))
    );
}

#[tokio::test]
async fn update_replaces_the_row_in_place_and_evicts_its_detail() {
    let remote = two_feeds_remote();
    let engine = engine(remote.clone());
    loaded(&engine, &all()).await;

    let id = TxId::Server("tx_1".to_string());
    let cached = engine.detail(&id).await.unwrap();
    assert_eq!(cached.amount, Money::new(100));

    let outcome = engine
        .update(
            id.clone(),
            TransactionPatch {
                amount: Some(Money::new(150)),
                ..TransactionPatch::default()
            },
        )
        .await
        .unwrap();
    assert!(matches!(outcome, MutationOutcome::Updated(ref tx) if tx.amount == Money::new(150)));

    let view = engine.view(&all());
    assert_eq!(ids(&view.items)[2], "tx_1");
    assert_eq!(view.items[2].amount, Money::new(150));
    assert_eq!(engine.detail(&id).await.unwrap().amount, Money::new(150));
}

#[tokio::test]
async fn update_requires_a_confirmed_entity() {
    let remote = ScriptedFeed::new();
    remote.fail_create(RemoteError::Validation("category missing".to_string()));
    let engine = engine(remote.clone());

    let err = engine.create(expense(500)).await.unwrap_err();
    assert_eq!(err, FeedError::Validation("category missing".to_string()));
    let temp = engine.recent()[0].target.clone();

    let err = engine
        .update(
            temp.clone(),
            TransactionPatch {
                note: Some("lunch".to_string()),
                ..TransactionPatch::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, FeedError::Unconfirmed(temp.to_string()));
    assert_eq!(ScriptedFeed::calls(&remote.update_calls), 0);

    let err = engine
        .update(TxId::Server("tx_1".to_string()), TransactionPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::Validation(_)));
}

#[tokio::test(start_paused = true)]
async fn timed_out_create_is_rolled_back() {
    let remote = ScriptedFeed::new();
    let engine = engine_with(
        remote.clone(),
        FeedConfig {
            mutation_timeout_ms: Some(200),
            ..FeedConfig::default()
        },
    );
    loaded(&engine, &all()).await;

    let _gate = remote.gate_create();
    let err = engine.create(expense(500)).await.unwrap_err();
    assert_eq!(err, FeedError::Transport("request timed out".to_string()));
    assert!(engine.view(&all()).items.is_empty());
}

#[tokio::test(start_paused = true)]
async fn burst_of_mutations_triggers_one_reconciliation() {
    let remote = ScriptedFeed::new();
    let engine = engine(remote.clone());
    loaded(&engine, &all()).await;
    let lists = ScriptedFeed::calls(&remote.list_calls);

    for cents in [100, 200, 300] {
        engine.create(expense(cents)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert_eq!(ScriptedFeed::calls(&remote.list_calls), lists);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    settle().await;
    assert_eq!(ScriptedFeed::calls(&remote.list_calls), lists + 1);
    assert_eq!(ids(&engine.view(&all()).items), vec!["tx_3", "tx_2", "tx_1"]);
}

#[tokio::test(start_paused = true)]
async fn logout_clears_the_cache_and_cancels_reconciliation() {
    let remote = two_feeds_remote();
    let engine = engine(remote.clone());
    let bus = InvalidationBus::new();
    let listener = engine.listen(&bus);
    loaded(&engine, &all()).await;
    let generation = engine.view(&all()).generation;

    engine.create(expense(500)).await.unwrap();
    let lists = ScriptedFeed::calls(&remote.list_calls);
    let mut events = engine.subscribe();

    bus.session_cleared();
    settle().await;
    assert_eq!(events.recv().await.unwrap(), feed_engine::FeedEvent::Cleared);
    assert!(engine.store().read(&all()).is_none());
    assert!(!engine.is_visible(&all()));
    assert!(engine.view(&all()).generation > generation);

    tokio::time::sleep(Duration::from_millis(2000)).await;
    settle().await;
    assert_eq!(ScriptedFeed::calls(&remote.list_calls), lists);

    engine.shutdown();
    listener.await.unwrap();
}

#[tokio::test]
async fn reconnect_through_the_bus_refetches_visible_feeds() {
    let remote = two_feeds_remote();
    let engine = engine(remote.clone());
    let bus = InvalidationBus::new();
    engine.listen(&bus);
    loaded(&engine, &all()).await;
    loaded(&engine, &expenses()).await;
    engine.release(&expenses());
    let lists = ScriptedFeed::calls(&remote.list_calls);

    bus.set_online(false);
    bus.set_online(true);
    settle().await;

    assert_eq!(ScriptedFeed::calls(&remote.list_calls), lists + 1);
    assert!(!engine.view(&all()).stale);
    assert!(engine.view(&expenses()).stale);
}
