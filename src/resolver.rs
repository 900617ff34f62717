//! Conversation resolver: channel identity → client + ACTIVE conversation.
//!
//! Two near-simultaneous inbound messages for the same identity must not
//! create two clients or two active conversations. The store's uniqueness
//! constraints decide the race; the loser re-reads the winner's row. The
//! process does not assume single-instance deployment, so no in-process
//! locking is involved.

use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::store::{Client, Conversation, Store, StoreError};

/// Find or create the client and its ACTIVE conversation for an inbound
/// identity. `name_hint` fills an unset display name and never overwrites a
/// known one.
pub fn resolve(
    store: &Store,
    tenant_id: &str,
    bot_config_id: &str,
    phone: &str,
    name_hint: Option<&str>,
) -> PipelineResult<(Client, Conversation)> {
    let client = resolve_client(store, tenant_id, phone, name_hint)?;
    let conversation = resolve_conversation(store, &client, bot_config_id)?;
    Ok((client, conversation))
}

fn resolve_client(
    store: &Store,
    tenant_id: &str,
    phone: &str,
    name_hint: Option<&str>,
) -> PipelineResult<Client> {
    let mut client = match store.client_by_phone(tenant_id, phone)? {
        Some(existing) => existing,
        None => match store.create_client(tenant_id, phone, name_hint) {
            Ok(created) => return Ok(created),
            Err(StoreError::Conflict(_)) => {
                // A concurrent message created the row between our read and
                // write; adopt it.
                debug!(tenant_id, phone, "client creation lost race, re-reading");
                store
                    .client_by_phone(tenant_id, phone)?
                    .ok_or(PipelineError::Conflict("client"))?
            }
            Err(e) => return Err(e.into()),
        },
    };

    if client.name.is_none() {
        if let Some(name) = name_hint.filter(|n| !n.is_empty()) {
            if store.set_client_name_if_unset(&client.id, name)? {
                client.name = Some(name.to_string());
            }
        }
    }

    Ok(client)
}

fn resolve_conversation(
    store: &Store,
    client: &Client,
    bot_config_id: &str,
) -> PipelineResult<Conversation> {
    if let Some(active) = store.active_conversation(&client.id)? {
        return Ok(active);
    }
    match store.create_conversation(&client.id, bot_config_id) {
        Ok(created) => Ok(created),
        Err(StoreError::Conflict(_)) => {
            debug!(client_id = %client.id, "conversation creation lost race, re-reading");
            store
                .active_conversation(&client.id)?
                .ok_or(PipelineError::Conflict("conversation"))
        }
        Err(e) => Err(e.into()),
    }
}
