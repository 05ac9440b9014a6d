#[macro_use]
extern crate human_panic;

use anyhow::{bail, Result};
use clap::{App, Arg};
use dotenv::dotenv;
use log::{debug, warn, LevelFilter};
use shadowx::{self, CipherKind, KeyMaterial, LocalHandler, RemoteAddress, RemoteHandler, SocksHandler};
use std::convert::TryInto;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::Instant;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let args = App::new("shadowx")
        .version("0.1.0")
        .about("An encrypted SOCKS5 tunneling proxy")
        .arg(
            Arg::new("DEBUG")
                .short('d')
                .long("debug")
                .about("Prints debug information verbosely")
        )
        .arg(
            Arg::new("MODE")
                .short('m')
                .long("mode")
                .about("Run the application-facing local end or the dialing remote end")
                .possible_values(&["local", "remote"])
                .default_value("local"),
        )
        .arg(
            Arg::new("PORT")
                .short('p')
                .long("port")
                .about("Port to use")
                .default_value("1080"),
        )
        .arg(
            Arg::new("REMOTE")
                .short('r')
                .long("remote")
                .about("Address of the remote end, e.g. shadow://host:port")
                .takes_value(true),
        )
        .arg(
            Arg::new("SECRET")
                .short('s')
                .long("secret")
                .about("Shared secret; both key material and tunnel token derive from it")
                .env("SHADOWX_SECRET")
                .takes_value(true),
        )
        .arg(
            Arg::new("PROTO_CIPHER")
                .long("protocol-cipher")
                .about("Cipher for protocol messages")
                .possible_values(&CipherKind::NAMES)
                .default_value("aes-128-cfb"),
        )
        .arg(
            Arg::new("DATA_CIPHER")
                .long("data-cipher")
                .about("Cipher for relayed payload")
                .possible_values(&CipherKind::NAMES)
                .default_value("aes-128-cfb"),
        )
        .arg(
            Arg::new("CONN_LIMIT")
                .long("connections-limit")
                .about("Concurrent connections limit (0=unlimted)")
                .default_value("0"),
        )
        .arg(
            Arg::new("RAND_PASSWORD")
                .long("rand-password")
                .about("Generate a random table-cipher password and exit")
        )
        .get_matches();

    let mut logger = env_logger::builder();
    logger.format_module_path(false);

    if args.is_present("DEBUG") {
        logger.filter_level(LevelFilter::Debug).init();
    } else {
        logger.filter_level(LevelFilter::Info).init();

        setup_panic!(Metadata {
            name: "shadowx".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            authors: env!("CARGO_PKG_AUTHORS").replace(":", ", ").into(),
            homepage: env!("CARGO_PKG_HOMEPAGE").into(),
        });
    }

    if args.is_present("RAND_PASSWORD") {
        println!("{}", shadowx::rand_password());
        return Ok(());
    }

    let secret = match args.value_of("SECRET") {
        Some(secret) => secret.to_string(),
        None => bail!("A secret is required (--secret or SHADOWX_SECRET)."),
    };

    let proto_kind: CipherKind = args.value_of("PROTO_CIPHER").unwrap_or_default().parse()?;
    let data_kind: CipherKind = args.value_of("DATA_CIPHER").unwrap_or_default().parse()?;

    // Key material is validated once, before anything listens.
    let proto_key = KeyMaterial::derive(proto_kind, &secret)?;
    let data_key = KeyMaterial::derive(data_kind, &secret)?;

    let conn_limit = args.value_of("CONN_LIMIT").unwrap_or("0");
    let semaphore = if conn_limit != "0" {
        Some(Arc::new(Semaphore::new(conn_limit.parse()?)))
    } else {
        None
    };

    let port = args.value_of("PORT").unwrap_or("1080");
    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    match args.value_of("MODE") {
        Some("local") => {
            let remote: RemoteAddress = match args.value_of("REMOTE") {
                Some(remote) => remote.to_string().try_into()?,
                None => bail!("--remote is required in local mode."),
            };

            let handler = Arc::new(LocalHandler::new(remote, secret, proto_key, data_key).await?);

            loop {
                let (incoming, _) = listener.accept().await?;

                let handler = Arc::clone(&handler);
                let semaphore = semaphore.clone();

                tokio::spawn(process(incoming, handler, semaphore));
            }
        }
        Some("remote") => {
            let handler = Arc::new(RemoteHandler::new(secret, proto_key, data_key));

            loop {
                let (incoming, _) = listener.accept().await?;

                let handler = Arc::clone(&handler);
                let semaphore = semaphore.clone();

                tokio::spawn(process(incoming, handler, semaphore));
            }
        }
        Some(mode) => panic!("Unsupported mode: {}", mode),
        None => unreachable!(),
    }
}

async fn process<H>(
    incoming: TcpStream,
    handler: Arc<H>,
    semaphore: Option<Arc<Semaphore>>,
) where
    H: SocksHandler + Send + Sync + 'static,
{
    let mut incoming = incoming;
    let start_time = Instant::now();

    let handled = if let Some(semaphore) = semaphore {
        let permit = semaphore.try_acquire();
        if permit.is_ok() {
            handler.accept_request(&mut incoming).await
        } else {
            handler.refuse_request(&mut incoming).await
        }
    } else {
        handler.accept_request(&mut incoming).await
    };

    if let Err(e) = handled {
        warn!("connection closed: {:#}", e);
    }

    debug!("{}ms", Instant::now().saturating_duration_since(start_time).as_millis());
}
