use std::time::Duration;

use clap::Parser;
use lazytoken::{
    issuer::oauth2::{dto::ClientCredentials, ClientCredentialsIssuer},
    Audience, ClientId, ClientSecret, TokenCache, TokenStatus,
};
use lazytoken_clock::DurationSecs;
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The issuing authority's token request URL
    #[arg(short, long, env)]
    token_url: reqwest::Url,

    /// The client ID of the client
    #[arg(short, long, env)]
    client_id: ClientId,

    /// The client secret used to identify the client to the issuing authority
    #[arg(short = 's', long, env, hide_env_values = true)]
    client_secret: ClientSecret,

    /// The audience to request a token for
    #[arg(short, long, env)]
    audience: Audience,

    /// Seconds before expiry at which a token is refreshed
    ///
    /// Defaults to one tenth of the first token's lifetime.
    #[arg(short = 'd', long, env)]
    min_expiration_delay: Option<u64>,

    /// Seconds between token pulls
    #[arg(short = 'i', long, env, default_value_t = 5)]
    interval: u64,
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    // The blocking client must be built outside of the async runtime.
    let client = reqwest::blocking::Client::builder().https_only(true).build()?;

    let issuer = ClientCredentialsIssuer::new(
        client,
        opts.token_url,
        ClientCredentials {
            client_id: opts.client_id,
            client_secret: opts.client_secret,
        },
    );

    let mut builder = TokenCache::builder(issuer, opts.audience);
    if let Some(delay) = opts.min_expiration_delay {
        builder = builder.with_min_expiration_delay(DurationSecs(delay));
    }
    let cache = builder.build()?;

    tracing::info!(
        token = format_args!("{:#?}", cache.cached_token().access_token()),
        min_expiration_delay = cache.min_expiration_delay().0,
        "first access token"
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(pull_forever(cache.clone(), Duration::from_secs(opts.interval)))
}

async fn pull_forever(
    cache: TokenCache<ClientCredentialsIssuer>,
    period: Duration,
) -> color_eyre::Result<()> {
    let mut interval = time::interval(period);
    loop {
        interval.tick().await;

        let status = cache.token_status();
        let token = match cache.get_token_async().await {
            Ok(token) => token,
            Err(error) => {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    "unable to get token, will try again"
                );
                continue;
            }
        };

        let cached = cache.cached_token();
        match status {
            TokenStatus::Fresh => {
                tracing::debug!(
                    ?status,
                    token = format_args!("{:#?}", token),
                    stale = cached.stale().0,
                    expiry = cached.expiry().0,
                    "pulled token"
                )
            }
            TokenStatus::Stale | TokenStatus::Expired => {
                tracing::info!(
                    ?status,
                    token = format_args!("{:#?}", token),
                    stale = cached.stale().0,
                    expiry = cached.expiry().0,
                    "pulled refreshed token"
                )
            }
        }
    }
}
