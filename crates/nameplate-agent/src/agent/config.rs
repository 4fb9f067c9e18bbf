use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use core::fmt;
use core::num::NonZeroU32;
use core::time::Duration;
use nameplate::{
    ClaimConfig, Credentials, DEFAULT_POOL_ROOT, DEFAULT_SEMAPHORE_PATH, NamespaceLayout,
    ScanLimit, SessionConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default location of the published name.
pub const DEFAULT_NAME_FILE: &str = "/var/run/nameplate/server_name";

/// Command line of the `nameplate-agent` binary.
///
/// Every option can also be set through the environment variable named in
/// its help text, or through a `.env` file in the working directory.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "nameplate-agent",
    version,
    about = "Claims an exclusive server name from a shared pool and publishes it locally"
)]
pub struct CliArgs {
    #[command(flatten)]
    pub coordinator: CoordinatorArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Claim a slot and keep the name file up to date until shut down.
    Claim(ClaimArgs),
    /// Write earned names into the pool.
    Assign(AssignArgs),
    /// Print the currently published name, if any.
    Current(CurrentArgs),
    /// Run a whole fleet against an in-process coordination service.
    Demo(DemoArgs),
}

/// Connection and namespace settings shared by every subcommand.
#[derive(Args, Clone)]
pub struct CoordinatorArgs {
    /// Coordination service to connect to.
    ///
    /// `memory://` runs an in-process service that lives as long as the
    /// command does. Anything else is a ZooKeeper connect string,
    /// `[zk://]host:port[,host:port...][/chroot]`.
    ///
    /// Environment variable: `NAMEPLATE_COORDINATOR`
    #[arg(
        long,
        global = true,
        env = "NAMEPLATE_COORDINATOR",
        default_value_t = String::from("memory://")
    )]
    pub coordinator: String,

    /// Username presented to the coordination service.
    ///
    /// Environment variable: `NAMEPLATE_USERNAME`
    #[arg(long, global = true, env = "NAMEPLATE_USERNAME")]
    pub username: Option<String>,

    /// Password presented to the coordination service.
    ///
    /// Environment variable: `NAMEPLATE_PASSWORD`
    #[arg(long, global = true, env = "NAMEPLATE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Seconds the service keeps our session alive without hearing from us.
    ///
    /// Environment variable: `NAMEPLATE_SESSION_TIMEOUT_SECS`
    #[arg(
        long,
        global = true,
        env = "NAMEPLATE_SESSION_TIMEOUT_SECS",
        default_value_t = 10
    )]
    pub session_timeout_secs: u64,

    /// Parent node of the pool slots.
    ///
    /// Environment variable: `NAMEPLATE_ROOT`
    #[arg(
        long,
        global = true,
        env = "NAMEPLATE_ROOT",
        default_value_t = String::from(DEFAULT_POOL_ROOT)
    )]
    pub root: String,

    /// Node under which the admission semaphore keeps its bookkeeping. Must
    /// not be inside the pool root.
    ///
    /// Environment variable: `NAMEPLATE_SEMAPHORE_PATH`
    #[arg(
        long,
        global = true,
        env = "NAMEPLATE_SEMAPHORE_PATH",
        default_value_t = String::from(DEFAULT_SEMAPHORE_PATH)
    )]
    pub semaphore_path: String,

    /// Slots to create before starting. Existing slots are left alone.
    #[arg(long = "seed-slot", global = true, value_name = "SLOT")]
    pub seed_slots: Vec<String>,
}

impl fmt::Debug for CoordinatorArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorArgs")
            .field("coordinator", &self.coordinator)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("session_timeout_secs", &self.session_timeout_secs)
            .field("root", &self.root)
            .field("semaphore_path", &self.semaphore_path)
            .field("seed_slots", &self.seed_slots)
            .finish()
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClaimArgs {
    /// File the held name is published to.
    ///
    /// Environment variable: `NAMEPLATE_NAME_FILE`
    #[arg(long, env = "NAMEPLATE_NAME_FILE", default_value = DEFAULT_NAME_FILE)]
    pub name_file: PathBuf,

    /// Identity recorded in lock and lease nodes. Defaults to the host name.
    ///
    /// Environment variable: `NAMEPLATE_IDENTITY`
    #[arg(long, env = "NAMEPLATE_IDENTITY")]
    pub identity: Option<String>,

    /// Seconds one admission attempt may wait before it is retried.
    ///
    /// Environment variable: `NAMEPLATE_ADMISSION_TIMEOUT_SECS`
    #[arg(long, env = "NAMEPLATE_ADMISSION_TIMEOUT_SECS", default_value_t = 60)]
    pub admission_timeout_secs: u64,

    /// Pause after a scan pass that found no free slot.
    ///
    /// Environment variable: `NAMEPLATE_SCAN_BACKOFF_MS`
    #[arg(long, env = "NAMEPLATE_SCAN_BACKOFF_MS", default_value_t = 1_000)]
    pub scan_backoff_ms: u64,

    /// Give up after this many scan passes. Unset scans forever.
    ///
    /// Environment variable: `NAMEPLATE_MAX_SCAN_PASSES`
    #[arg(long, env = "NAMEPLATE_MAX_SCAN_PASSES")]
    pub max_scan_passes: Option<u32>,

    /// Serve the gRPC health protocol here. The `nameplate.Claimant` service
    /// reports SERVING only while a slot is held.
    ///
    /// Environment variable: `NAMEPLATE_HEALTH_ADDR`
    #[arg(long, env = "NAMEPLATE_HEALTH_ADDR")]
    pub health_addr: Option<SocketAddr>,
}

#[derive(Args, Debug, Clone)]
pub struct AssignArgs {
    /// JSON array of `{"name": ..., "score": ...}` candidates; `-` reads
    /// standard input.
    #[arg(long, default_value = "-")]
    pub candidates: String,

    /// Revenue reached over the period.
    #[arg(long)]
    pub revenue: u64,

    /// Revenue goal; one name is earned per whole multiple reached.
    #[arg(long)]
    pub goal: u64,

    /// Rename notice template. Variants are separated by `---` lines and use
    /// `{old}` and `{new}` placeholders.
    #[arg(long)]
    pub notice_template: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct CurrentArgs {
    /// File the held name is published to.
    ///
    /// Environment variable: `NAMEPLATE_NAME_FILE`
    #[arg(long, env = "NAMEPLATE_NAME_FILE", default_value = DEFAULT_NAME_FILE)]
    pub name_file: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    /// Slots in the demo pool.
    #[arg(long = "slot", default_values_t = [String::from("alpha"), String::from("beta"), String::from("gamma")])]
    pub slots: Vec<String>,

    /// Number of claimants to start.
    #[arg(long, default_value_t = 4)]
    pub claimants: usize,

    /// Names to assign once the pool has filled.
    #[arg(long = "name", default_values_t = [String::from("zeus"), String::from("hera")])]
    pub names: Vec<String>,

    /// Directory for the claimants' name files. Defaults to a temporary
    /// directory.
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

/// Validated connection settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub session: SessionConfig,
    pub layout: NamespaceLayout,
    pub seed_slots: Vec<String>,
}

impl TryFrom<CoordinatorArgs> for CoordinatorConfig {
    type Error = anyhow::Error;

    fn try_from(args: CoordinatorArgs) -> Result<Self, Self::Error> {
        if args.session_timeout_secs == 0 {
            bail!("NAMEPLATE_SESSION_TIMEOUT_SECS must be greater than 0");
        }

        let credentials = match (args.username, args.password) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            (None, None) => None,
            _ => bail!("NAMEPLATE_USERNAME and NAMEPLATE_PASSWORD must be set together"),
        };

        let layout = NamespaceLayout::new(args.root, args.semaphore_path)
            .context("invalid namespace layout")?;

        for slot in &args.seed_slots {
            validate_segment("seed slot", slot)?;
        }

        Ok(Self {
            session: SessionConfig {
                connect: args.coordinator,
                credentials,
                session_timeout: Duration::from_secs(args.session_timeout_secs),
            },
            layout,
            seed_slots: args.seed_slots,
        })
    }
}

/// Validated settings for the `claim` subcommand.
#[derive(Debug, Clone)]
pub struct ClaimSettings {
    pub claim: ClaimConfig,
    pub name_file: PathBuf,
    pub health_addr: Option<SocketAddr>,
}

impl ClaimSettings {
    pub fn new(args: ClaimArgs, layout: NamespaceLayout) -> anyhow::Result<Self> {
        if args.admission_timeout_secs == 0 {
            bail!("NAMEPLATE_ADMISSION_TIMEOUT_SECS must be greater than 0");
        }

        let scan_limit = match args.max_scan_passes {
            None => ScanLimit::Unbounded,
            Some(passes) => ScanLimit::Passes(
                NonZeroU32::new(passes)
                    .context("NAMEPLATE_MAX_SCAN_PASSES must be greater than 0")?,
            ),
        };

        let identity = resolve_identity(args.identity)?;

        Ok(Self {
            claim: ClaimConfig {
                layout,
                identity,
                admission_timeout: Duration::from_secs(args.admission_timeout_secs),
                scan_backoff: Duration::from_millis(args.scan_backoff_ms),
                scan_limit,
            },
            name_file: args.name_file,
            health_addr: args.health_addr,
        })
    }
}

/// Uses `explicit` if given, otherwise the kernel's host name.
pub fn resolve_identity(explicit: Option<String>) -> anyhow::Result<String> {
    let identity = match explicit {
        Some(identity) => identity.trim().to_owned(),
        None => host_name().context("could not determine the host name; set NAMEPLATE_IDENTITY")?,
    };
    validate_segment("identity", &identity)?;
    Ok(identity)
}

fn host_name() -> Option<String> {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .into_iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .chain(std::env::var("HOSTNAME").ok())
        .map(|name| name.trim().to_owned())
        .find(|name| !name.is_empty())
}

/// Identities and slot names become node names, so they must be a single
/// non-empty path segment.
fn validate_segment(what: &str, value: &str) -> anyhow::Result<()> {
    if value.is_empty() {
        bail!("{what} must not be empty");
    }
    if value.contains('/') || value == "." || value == ".." {
        bail!("{what} {value:?} is not a valid node name");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("nameplate-agent").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults_describe_the_standard_layout() {
        let args = parse(&["claim", "--identity", "web-01"]);
        let coordinator = CoordinatorConfig::try_from(args.coordinator).unwrap();
        assert_eq!(coordinator.layout, NamespaceLayout::default());
        assert_eq!(coordinator.session.connect, "memory://");
        assert!(coordinator.session.credentials.is_none());

        let Command::Claim(claim) = args.command else {
            panic!("expected the claim subcommand");
        };
        let settings = ClaimSettings::new(claim, coordinator.layout).unwrap();
        assert_eq!(settings.claim.identity, "web-01");
        assert_eq!(settings.claim.scan_limit, ScanLimit::Unbounded);
        assert_eq!(settings.claim.admission_timeout, Duration::from_secs(60));
        assert_eq!(settings.claim.scan_backoff, Duration::from_secs(1));
        assert_eq!(settings.name_file, PathBuf::from(DEFAULT_NAME_FILE));
    }

    #[test]
    fn global_options_follow_the_subcommand() {
        let args = parse(&[
            "claim",
            "--root",
            "/fleet/names",
            "--semaphore-path",
            "/fleet/admission",
            "--seed-slot",
            "alpha",
            "--seed-slot",
            "beta",
            "--max-scan-passes",
            "3",
            "--identity",
            "web-01",
        ]);
        let coordinator = CoordinatorConfig::try_from(args.coordinator).unwrap();
        assert_eq!(coordinator.layout.root, "/fleet/names");
        assert_eq!(coordinator.seed_slots, ["alpha", "beta"]);

        let Command::Claim(claim) = args.command else {
            panic!("expected the claim subcommand");
        };
        let settings = ClaimSettings::new(claim, coordinator.layout).unwrap();
        assert_eq!(
            settings.claim.scan_limit,
            ScanLimit::Passes(NonZeroU32::new(3).unwrap())
        );
    }

    #[test]
    fn rejects_invalid_settings() {
        let args = parse(&["claim", "--semaphore-path", "/nameplate/server-names/sem"]);
        assert!(CoordinatorConfig::try_from(args.coordinator).is_err());

        let args = parse(&["claim", "--username", "alice"]);
        assert!(CoordinatorConfig::try_from(args.coordinator).is_err());

        let args = parse(&["claim", "--session-timeout-secs", "0"]);
        assert!(CoordinatorConfig::try_from(args.coordinator).is_err());

        for extra in [
            ["--max-scan-passes", "0"],
            ["--admission-timeout-secs", "0"],
            ["--identity", "a/b"],
        ] {
            let args = parse(&["claim", extra[0], extra[1]]);
            let Command::Claim(claim) = args.command else {
                panic!("expected the claim subcommand");
            };
            assert!(
                ClaimSettings::new(claim, NamespaceLayout::default()).is_err(),
                "{extra:?} should be rejected"
            );
        }
    }

    #[test]
    fn password_is_redacted() {
        let args = parse(&["current", "--username", "alice", "--password", "hunter2"]);
        assert!(!format!("{:?}", args.coordinator).contains("hunter2"));
        let coordinator = CoordinatorConfig::try_from(args.coordinator).unwrap();
        assert!(!format!("{coordinator:?}").contains("hunter2"));
    }

    #[test]
    fn explicit_identity_is_trimmed() {
        assert_eq!(resolve_identity(Some(" web-01 \n".into())).unwrap(), "web-01");
        assert!(resolve_identity(Some("  ".into())).is_err());
    }

    #[test]
    fn demo_has_a_usable_default_fleet() {
        let args = parse(&["demo"]);
        let Command::Demo(demo) = args.command else {
            panic!("expected the demo subcommand");
        };
        assert_eq!(demo.slots, ["alpha", "beta", "gamma"]);
        assert_eq!(demo.claimants, 4);
        assert_eq!(demo.names, ["zeus", "hera"]);
    }
}
