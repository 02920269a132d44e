//! Production credentials loader and token builder. Tokens are SigV4
//! presigned `connect` URLs for the `rds-db` service, valid 15 minutes on the
//! backend regardless of what the cache stamps locally.

use crate::auth_token::{ProviderLoader, TokenBuilder};

use anyhow::Context;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_sigv4::http_request::{
    sign, SignableBody, SignableRequest, SignatureLocation, SigningSettings,
};
use aws_sigv4::sign::v4;
use std::time::{Duration, SystemTime};

/// Backend-side token lifetime fixed by the service.
const PRESIGN_EXPIRES: Duration = Duration::from_secs(15 * 60);

pub type AwsProvider = SharedCredentialsProvider;

/// Resolves the default AWS credential chain for a region, honoring a named
/// credential profile when the proxy profile carries one.
pub struct AwsProviderLoader;

#[async_trait]
impl ProviderLoader<AwsProvider> for AwsProviderLoader {
    async fn load(
        &self,
        region: &str,
        credential_profile: Option<&str>,
    ) -> anyhow::Result<AwsProvider> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()));
        if let Some(profile) = credential_profile {
            loader = loader.profile_name(profile);
        }
        let config = loader.load().await;
        config
            .credentials_provider()
            .context("resolved AWS config has no credentials provider")
    }
}

pub struct RdsTokenBuilder;

#[async_trait]
impl TokenBuilder<AwsProvider> for RdsTokenBuilder {
    async fn build(
        &self,
        endpoint: &str,
        region: &str,
        db_user: &str,
        provider: &AwsProvider,
    ) -> anyhow::Result<String> {
        let credentials = provider
            .provide_credentials()
            .await
            .context("credential chain yielded no credentials")?;
        let identity = credentials.into();

        let mut settings = SigningSettings::default();
        settings.signature_location = SignatureLocation::QueryParams;
        settings.expires_in = Some(PRESIGN_EXPIRES);

        let params: aws_sigv4::http_request::SigningParams = v4::SigningParams::builder()
            .identity(&identity)
            .region(region)
            .name("rds-db")
            .time(SystemTime::now())
            .settings(settings)
            .build()
            .context("failed to build signing params")?
            .into();

        let base_url = format!("https://{endpoint}/?Action=connect&DBUser={db_user}");
        let signable = SignableRequest::new(
            "GET",
            &base_url,
            std::iter::empty(),
            SignableBody::Bytes(b""),
        )
        .context("failed to build signable request")?;

        let (instructions, _signature) = sign(signable, &params)
            .context("sigv4 signing failed")?
            .into_parts();

        let mut request = http::Request::builder()
            .method("GET")
            .uri(&base_url)
            .body(())
            .context("failed to build presign carrier request")?;
        instructions.apply_to_request_http1x(&mut request);

        // the auth token is the signed URL minus its scheme
        let signed = request.uri().to_string();
        Ok(signed
            .strip_prefix("https://")
            .map(str::to_string)
            .unwrap_or(signed))
    }
}
