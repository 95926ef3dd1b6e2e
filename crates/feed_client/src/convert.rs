//! Mapping between engine types and the JSON wire contract.

use api_types::{
    feed::{FeedList, FeedListResponse},
    transaction::{self, TransactionNew, TransactionUpdate, TransactionView},
};
use feed_engine::{
    Classification, FeedQuery, Money, NewTransaction, RemoteError, RemotePage, SyncState,
    Transaction, TransactionPatch, TxId,
};

fn classification_to_wire(value: Classification) -> transaction::Classification {
    match value {
        Classification::Expense => transaction::Classification::Expense,
        Classification::Income => transaction::Classification::Income,
    }
}

fn classification_from_wire(value: transaction::Classification) -> Classification {
    match value {
        transaction::Classification::Expense => Classification::Expense,
        transaction::Classification::Income => Classification::Income,
    }
}

pub(crate) fn transaction_from_view(view: TransactionView) -> Result<Transaction, RemoteError> {
    if view.id.trim().is_empty() {
        return Err(RemoteError::Server("transaction without id".to_string()));
    }
    if view.amount_minor <= 0 {
        return Err(RemoteError::Server(format!(
            "invalid amount for {}: {}",
            view.id, view.amount_minor
        )));
    }
    Ok(Transaction {
        id: TxId::Server(view.id),
        sync: SyncState::Confirmed,
        classification: classification_from_wire(view.classification),
        amount: Money::new(view.amount_minor),
        category: view.category,
        occurred_on: view.occurred_on,
        description: view.description,
        note: view.note,
    })
}

pub(crate) fn transaction_to_view(tx: &Transaction) -> TransactionView {
    TransactionView {
        id: tx.id.to_string(),
        classification: classification_to_wire(tx.classification),
        amount_minor: tx.amount.cents(),
        category: tx.category.clone(),
        occurred_on: tx.occurred_on,
        description: tx.description.clone(),
        note: tx.note.clone(),
    }
}

pub(crate) fn list_request(query: FeedQuery) -> FeedList {
    let filter = query.filter;
    let (from, to) = filter.date_range();
    FeedList {
        from,
        to,
        classification: filter.classification_filter().map(classification_to_wire),
        search: filter.search_text().map(str::to_string),
        cursor: query.cursor,
        limit: Some(query.limit),
    }
}

pub(crate) fn page_from_response(res: FeedListResponse) -> Result<RemotePage, RemoteError> {
    let items = res
        .items
        .into_iter()
        .map(transaction_from_view)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RemotePage {
        items,
        // A cursor without more rows behind it would only yield an empty page.
        next_cursor: res.next_cursor.filter(|_| res.has_more),
        has_more: res.has_more,
        total: res.total,
    })
}

pub(crate) fn create_request(entity: NewTransaction, idempotency_key: String) -> TransactionNew {
    TransactionNew {
        classification: classification_to_wire(entity.classification),
        amount_minor: entity.amount.cents(),
        category: entity.category,
        occurred_on: entity.occurred_on,
        description: entity.description,
        note: entity.note,
        idempotency_key: Some(idempotency_key),
    }
}

pub(crate) fn update_request(patch: TransactionPatch) -> TransactionUpdate {
    TransactionUpdate {
        classification: patch.classification.map(classification_to_wire),
        amount_minor: patch.amount.map(Money::cents),
        category: patch.category,
        occurred_on: patch.occurred_on,
        description: patch.description,
        note: patch.note,
    }
}
