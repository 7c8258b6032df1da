//! One-time identity bootstrap: generate, persist, publish.

use crate::context::DeviceContext;
use crate::error::CryptoError;
use crate::prekeys::{OneTimePreKeyPublic, PreKeyUpload};
use crate::store::IdentityRecord;

/// One-time pre-keys generated per device at bootstrap. Replenishment is
/// out of scope; the batch shrinks as handshakes consume keys.
const ONE_TIME_PREKEY_COUNT: u32 = 100;

/// Bundles carry a single signed pre-key; rotation is out of scope.
const SIGNED_PREKEY_ID: u32 = 1;

/// Ensure a long-term identity and a published pre-key bundle exist for
/// this device. Idempotent.
///
/// Publication is the commit point: the `published` marker is written only
/// after the directory accepts the upload, and callers must not treat the
/// device as ready for encrypted channels until this returns `Ok`. If a
/// previous run persisted key material but the upload failed, the same
/// public projection is re-uploaded rather than regenerated.
pub async fn ensure_identity(ctx: &DeviceContext) -> Result<(), CryptoError> {
    let store = ctx.store();

    if let Some(identity) = store.identity().await? {
        if store.is_published().await? {
            tracing::debug!(user = %ctx.user_id(), device = %ctx.device_id(), "identity already installed");
            return Ok(());
        }

        let upload = match rebuild_upload(ctx, &identity).await? {
            Some(upload) => upload,
            // Signed pre-key lost mid-bootstrap: keep the identity, mint a
            // fresh bundle for it.
            None => generate_bundle_for(ctx, &identity).await?,
        };
        ctx.directory().publish_bundle(ctx.user_id(), &upload).await?;
        store.mark_published().await?;
        tracing::info!(
            user = %ctx.user_id(),
            device = %ctx.device_id(),
            "re-published pre-key bundle after earlier upload failure"
        );
        return Ok(());
    }

    let engine = ctx.engine().get()?;
    let generated = engine.generate_identity().await?;
    let bundle = engine
        .generate_prekey_bundle(
            &generated.public_key,
            &generated.private_key,
            generated.registration_id,
            ONE_TIME_PREKEY_COUNT,
        )
        .await?;

    store
        .set_identity(&IdentityRecord {
            public_key: generated.public_key.clone(),
            private_key: generated.private_key.clone(),
        })
        .await?;
    store.set_registration_id(generated.registration_id).await?;
    store.set_signed_prekey(&bundle.signed).await?;
    for otp in &bundle.one_time {
        store.set_one_time_prekey(otp).await?;
    }

    let upload = PreKeyUpload {
        device_id: ctx.device_id().to_string(),
        identity_key: generated.public_key,
        signed_prekey_id: bundle.signed.id,
        signed_prekey: bundle.signed.public_key.clone(),
        signed_prekey_signature: bundle.signed.signature.clone(),
        registration_id: generated.registration_id,
        one_time_prekeys: bundle
            .one_time
            .iter()
            .map(|k| OneTimePreKeyPublic {
                id: k.id,
                public_key: k.public_key.clone(),
            })
            .collect(),
    };
    ctx.directory().publish_bundle(ctx.user_id(), &upload).await?;
    store.mark_published().await?;

    tracing::info!(
        user = %ctx.user_id(),
        device = %ctx.device_id(),
        identity = %hex::encode(&upload.identity_key),
        one_time_keys = upload.one_time_prekeys.len(),
        "identity installed and pre-key bundle published"
    );
    Ok(())
}

/// Re-derive the public projection from persisted private material.
/// Returns `None` when the signed pre-key record is missing.
async fn rebuild_upload(
    ctx: &DeviceContext,
    identity: &IdentityRecord,
) -> Result<Option<PreKeyUpload>, CryptoError> {
    let store = ctx.store();
    let Some(signed) = store.signed_prekey(SIGNED_PREKEY_ID).await? else {
        return Ok(None);
    };
    let registration_id = store.registration_id().await?.ok_or(CryptoError::NoIdentity)?;

    let mut one_time_prekeys = Vec::new();
    for id in 1..=ONE_TIME_PREKEY_COUNT {
        if let Some(record) = store.one_time_prekey(id).await? {
            one_time_prekeys.push(OneTimePreKeyPublic {
                id: record.id,
                public_key: record.public_key,
            });
        }
    }

    Ok(Some(PreKeyUpload {
        device_id: ctx.device_id().to_string(),
        identity_key: identity.public_key.clone(),
        signed_prekey_id: signed.id,
        signed_prekey: signed.public_key,
        signed_prekey_signature: signed.signature,
        registration_id,
        one_time_prekeys,
    }))
}

/// Generate and persist a fresh bundle for an existing identity.
async fn generate_bundle_for(
    ctx: &DeviceContext,
    identity: &IdentityRecord,
) -> Result<PreKeyUpload, CryptoError> {
    let store = ctx.store();
    let registration_id = store.registration_id().await?.ok_or(CryptoError::NoIdentity)?;
    let engine = ctx.engine().get()?;
    let bundle = engine
        .generate_prekey_bundle(
            &identity.public_key,
            &identity.private_key,
            registration_id,
            ONE_TIME_PREKEY_COUNT,
        )
        .await?;

    store.set_signed_prekey(&bundle.signed).await?;
    for otp in &bundle.one_time {
        store.set_one_time_prekey(otp).await?;
    }

    Ok(PreKeyUpload {
        device_id: ctx.device_id().to_string(),
        identity_key: identity.public_key.clone(),
        signed_prekey_id: bundle.signed.id,
        signed_prekey: bundle.signed.public_key.clone(),
        signed_prekey_signature: bundle.signed.signature.clone(),
        registration_id,
        one_time_prekeys: bundle
            .one_time
            .iter()
            .map(|k| OneTimePreKeyPublic {
                id: k.id,
                public_key: k.public_key.clone(),
            })
            .collect(),
    })
}
