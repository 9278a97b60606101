//! Opening and closing account sessions

use keyward_model::{Account, Store};
use keyward_transport::{
    ConnectTarget, Credential, TransportFactory, TransportSession, TrustPolicy, resolve_credential,
};
use tracing::debug;

use crate::error::CoreError;

/// Connect to an account under strict host-key verification with the key it currently trusts
pub(crate) async fn open_verified(
    store: &dyn Store,
    transport: &dyn TransportFactory,
    account: &Account,
) -> Result<Box<dyn TransportSession>, CoreError> {
    let credential = resolve_credential(account, store).await?;
    open_with(transport, &ConnectTarget::from_account(account), &credential, &TrustPolicy::Verify).await
}

pub(crate) async fn open_with(
    transport: &dyn TransportFactory,
    target: &ConnectTarget,
    credential: &Credential,
    policy: &TrustPolicy,
) -> Result<Box<dyn TransportSession>, CoreError> {
    Ok(transport.open(target, credential, policy).await?)
}

/// Close a session; a failed close never masks the operation's result
pub(crate) async fn close_quietly(session: Box<dyn TransportSession>) {
    if let Err(e) = session.close().await {
        debug!(host = %session.host(), error = %e, "closing session failed");
    }
}
