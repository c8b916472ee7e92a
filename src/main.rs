//! Server binary for the tally counting game
//!
//! Wires the configured store, verification gate, and identity resolver
//! together and serves until interrupted. With `REDIS_URL` set, the
//! counter lives in redis and committed events are shared with the other
//! instances; without it, a single instance keeps everything in memory.

use garde::Validate;
use tally::{
    auth::Authenticator,
    bus,
    config::Config,
    game::Options,
    server,
    store::{memory::MemoryStore, redis::RedisStore},
    verify::Turnstile,
};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = Config::load();

    let options = Options::new(config.target, config.verification_threshold);
    options.validate().expect("Environment misconfigured!");

    let gate = Turnstile::new(config.turnstile_secret.clone());
    let auth = match &config.auth_url {
        Some(url) => Authenticator::remote(url.clone()),
        None => Authenticator::allow_all(),
    };

    match &config.redis_url {
        Some(url) => {
            let store = RedisStore::connect(url)
                .await
                .expect("Redis misconfigured!");
            let client = redis::Client::open(url.as_str()).expect("Redis misconfigured!");
            let publisher = bus::start_publisher(store.connection());

            let state = server::init_state(store, gate, auth, options, Some(publisher))
                .await
                .expect("cannot read game status");
            server::start_subscriber(state.clone(), client);

            server::serve(state, &config).await.expect("server failed");
        }
        None => {
            let store = MemoryStore::new();
            let state = server::init_state(store, gate, auth, options, None)
                .await
                .expect("cannot read game status");

            server::serve(state, &config).await.expect("server failed");
        }
    }

    println!("Server shutting down...");
}
