use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use k256::ecdsa::SigningKey;
use tracing::{error, info};

use discovery::{Config, NatMode, ProbeError, ProbeService, DEFAULT_PORT};
use wire::{EncodedPubkey, EnodeUrl, Netlist};

/// Conformance scenarios for a discv4 node-discovery target.
///
/// Speaks the discovery wire protocol at the given target from the outside
/// and checks that it answers well-formed requests, ignores malformed and
/// stale ones, and refuses queries that would make it an amplifier.
#[derive(Parser, Debug)]
#[command(name = "discv4-harness", version, about)]
struct Args {
    /// Hex-encoded secp256k1 private key signing outbound packets. An
    /// ephemeral key is generated when omitted.
    #[arg(long)]
    private_key: Option<String>,

    /// Local UDP listen port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    listen_port: u16,

    /// Externally visible address announced in outbound packets.
    #[arg(long)]
    announce_address: Option<SocketAddr>,

    /// NAT handling: any|none|upnp|pmp|extip:<ip>.
    #[arg(long, default_value = "none")]
    nat: NatMode,

    /// Comma-separated CIDR whitelist for peer-declared addresses.
    #[arg(long)]
    net_restrict: Option<Netlist>,

    /// The node under test, as an enode URL carrying its public key.
    #[arg(long)]
    target_enode: EnodeUrl,

    /// Replaces the IP inside the target enode, for targets whose reported
    /// address is not reachable from here.
    #[arg(long)]
    target_ip: Option<IpAddr>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let signing_key = match &args.private_key {
        Some(hex_key) => parse_private_key(hex_key)?,
        None => SigningKey::random(&mut rand::thread_rng()),
    };

    let mut target = args.target_enode;
    if let Some(ip) = args.target_ip {
        target = target.with_ip(ip);
    }

    let mut config = Config::new(signing_key);
    config.listen_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.listen_port));
    config.announce_addr = args.announce_address;
    config.nat = args.nat;
    config.net_restrict = args.net_restrict;

    let service = ProbeService::bind(config).await?;
    info!(
        target = %target,
        max_neighbors = wire::max_neighbors(),
        "starting conformance run"
    );

    let node = target.node_id();
    let addr = target.udp_addr();
    let pubkey = target.pubkey();

    assess(
        "ping (v4001)",
        Expect::Answered,
        service.ping(node, addr, true).await,
    )?;
    assess(
        "ping-wrong-to (v4002)",
        Expect::Answered,
        service.ping_wrong_to(node, addr).await,
    )?;
    assess(
        "ping-wrong-from (v4003)",
        Expect::Answered,
        service.ping_wrong_from(node, addr, true).await,
    )?;
    assess(
        "ping-extra-data (v4004)",
        Expect::Answered,
        service.ping_extra_data(node, addr, true).await,
    )?;
    assess(
        "ping-extra-data-wrong-from (v4005)",
        Expect::Answered,
        service.ping_extra_data_wrong_from(node, addr, true).await,
    )?;
    assess(
        "ping-wrong-packet-type (v4006)",
        Expect::Silence,
        service.ping_wrong_packet_type(node, addr).await,
    )?;
    assess(
        "findnode-without-bond (v4007)",
        Expect::Silence,
        service.findnode_without_bond(node, addr, pubkey).await,
    )?;
    assess(
        "ping-bonded-mangled-from (v4009)",
        Expect::Answered,
        service.ping_bonded_with_mangled_from(node, addr, true).await,
    )?;
    assess(
        "findnode-recently-bonded (v4010)",
        Expect::Answered,
        service.bonded_findnode(node, addr, pubkey).await,
    )?;
    assess(
        "ping-past-expiration (v4011)",
        Expect::Silence,
        service.ping_past_expiration(node, addr).await,
    )?;
    assess(
        "findnode-past-expiration (v4012)",
        Expect::Silence,
        service.findnode_past_expiration(node, addr, pubkey).await,
    )?;

    info!("all scenarios passed");
    Ok(())
}

/// Whether a scenario passes on a reply or on the absence of one.
enum Expect {
    Answered,
    Silence,
}

fn assess(name: &'static str, expect: Expect, outcome: Result<EncodedPubkey>) -> Result<()> {
    match (expect, outcome) {
        (Expect::Answered, Ok(recovered)) => {
            info!(scenario = name, node = %wire::node_id(&recovered), "pass");
            Ok(())
        }
        (Expect::Silence, Err(err)) if is_timeout(&err) => {
            info!(scenario = name, "pass, no reply within the deadline");
            Ok(())
        }
        (Expect::Silence, Ok(_)) => {
            bail!("scenario {name} failed: the target answered a request it must ignore")
        }
        (_, Err(err)) => Err(err.context(format!("scenario {name} failed"))),
    }
}

fn is_timeout(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<ProbeError>(), Some(ProbeError::Timeout))
}

fn parse_private_key(hex_key: &str) -> Result<SigningKey> {
    let bytes =
        hex::decode(hex_key.trim_start_matches("0x")).context("private key is not valid hex")?;
    SigningKey::from_slice(&bytes).context("private key is not a valid secp256k1 scalar")
}
