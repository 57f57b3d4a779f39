use std::{sync::Arc, time::Duration};

use clap::Parser;
use initiator_tokens::{
    provider::OidcClient, storage::FileTokenStorage, ClientId, ClientSecret,
    IdentityServerConnectionDetails, OidcClientOptions, TokenManager, TokenManagerConfig,
    TokenName,
};
use url::Url;

#[derive(Debug, Parser)]
struct Opts {
    /// The identity provider's authority URL
    #[clap(short, long, env)]
    authority: Url,

    /// The client ID of the client
    #[clap(short, long, env)]
    client_id: ClientId,

    /// The client secret, for confidential clients
    #[clap(short = 's', long, env, hide_env_values = true)]
    client_secret: Option<ClientSecret>,

    /// The redirect URI registered with the identity provider
    #[clap(short, long, env, default_value = "http://127.0.0.1:7890/callback")]
    redirect_uri: Url,

    /// The name to keep the tokens under
    #[clap(short = 'n', long, env, default_value = "default")]
    token_name: TokenName,

    /// How long before expiration tokens should be refreshed, in seconds
    #[clap(short, long, env, default_value_t = 60)]
    lead_time: u64,

    /// The local file used to store tokens
    #[clap(short = 'f', long, env, default_value = ".tokens.json")]
    tokens_file: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let mut options = OidcClientOptions::new(opts.authority, opts.client_id, opts.redirect_uri);
    if let Some(secret) = opts.client_secret {
        options = options.with_client_secret(secret);
    }

    let manager = TokenManager::builder(
        Arc::new(FileTokenStorage::new(opts.tokens_file)),
        Arc::new(OidcClient::default()),
    )
    .with_config(
        TokenManagerConfig::default()
            .with_refresh_lead_time(Duration::from_secs(opts.lead_time))
            .with_sign_in_timeout(Some(Duration::from_secs(120))),
    )
    .build();

    manager
        .add_server_details(
            opts.token_name.clone(),
            IdentityServerConnectionDetails::new(true, options),
        )
        .await;

    let mut refreshes = manager.subscribe();

    let Some(token) = manager.check_signin(&opts.token_name).await? else {
        color_eyre::eyre::bail!("unable to sign in");
    };

    tracing::info!(
        token = format_args!("{:#?}", token.token()),
        subject = token.claims().subject(),
        expiry = token.expiration_date().0,
        "signed in"
    );

    loop {
        match refreshes.recv().await {
            Ok(event) => tracing::info!(
                token_name = %event.token_name,
                token = format_args!("{:#?}", event.token.token()),
                expiry = event.token.expiration_date().0,
                "token refreshed"
            ),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "missed refresh notifications")
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }

    Ok(())
}
