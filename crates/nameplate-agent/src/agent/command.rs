use crate::agent::backend::Backend;
use crate::agent::config::{
    AssignArgs, ClaimArgs, ClaimSettings, CoordinatorConfig, CurrentArgs, DemoArgs,
};
use crate::agent::signal::shutdown_signal;
use crate::agent::{EXIT_FAILURE, EXIT_OK, exit_code, health, observe_claim, state_label, telemetry};
use anyhow::{Context, bail};
use core::time::Duration;
use nameplate::{
    Assigner, Assignment, Candidate, ClaimConfig, ClaimError, Claimant, CoordinationSession,
    MemoryEnsemble, NamePublisher, Notice, names_earned, read_published_name, shortlist,
};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// One line of `assign` and `demo` output.
#[derive(Serialize)]
struct AssignmentReport<'a> {
    #[serde(flatten)]
    assignment: &'a Assignment,
    notice: String,
}

fn print_assignments(assignments: &[Assignment], notice: &Notice) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    for assignment in assignments {
        let report = AssignmentReport {
            assignment,
            notice: notice.render(&assignment.previous_holder, &assignment.name),
        };
        serde_json::to_writer(&mut stdout, &report)?;
        writeln!(stdout)?;
    }
    Ok(())
}

fn log_startup_info(coordinator: &CoordinatorConfig, settings: &ClaimSettings) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting claimant with full config: {:#?} {:#?}",
            coordinator,
            settings
        );
    } else {
        tracing::info!(
            "Starting claimant {} against {} (pool {})",
            settings.claim.identity,
            coordinator.session.connect,
            coordinator.layout.root
        );
    }
}

/// Runs one claimant until shutdown or a fatal condition, returning the
/// process exit status.
pub async fn claim(coordinator: CoordinatorConfig, args: ClaimArgs) -> anyhow::Result<u8> {
    let settings = ClaimSettings::new(args, coordinator.layout.clone())?;
    log_startup_info(&coordinator, &settings);

    let health_listener = match settings.health_addr {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind health endpoint {addr}"))?,
        ),
        None => None,
    };

    let backend = Backend::open(&coordinator.session.connect)?;
    let session = backend.connect(&coordinator.session).await?;
    backend
        .seed(&*session, &coordinator.layout, &coordinator.seed_slots)
        .await?;

    let claimant = Claimant::new(
        Arc::clone(&session),
        settings.claim,
        NamePublisher::new(&settings.name_file),
    );
    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(shutdown_signal(shutdown.clone()));
    let observer = tokio::spawn(observe_claim(claimant.subscribe()));
    let health = health_listener.map(|listener| {
        tokio::spawn(health::serve(
            listener,
            claimant.subscribe(),
            shutdown.clone(),
        ))
    });

    let outcome = claimant.run(shutdown.clone()).await;
    shutdown.cancel();

    if let Some(health) = health {
        match health.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "health endpoint failed"),
            Err(e) => tracing::error!(error = %e, "health endpoint task failed"),
        }
    }
    if let Err(e) = signals.await {
        tracing::error!(error = %e, "signal task failed");
    }
    if let Err(e) = observer.await {
        tracing::error!(error = %e, "claim observer task failed");
    }

    if !matches!(outcome, Err(ClaimError::SessionLost)) {
        if let Err(e) = session.close().await {
            tracing::debug!(error = %e, "session already closed");
        }
    }
    Ok(exit_code(&outcome))
}

fn read_candidates(source: &str) -> anyhow::Result<Vec<Candidate>> {
    let raw = if source == "-" {
        std::io::read_to_string(std::io::stdin()).context("failed to read candidates from stdin")?
    } else {
        std::fs::read_to_string(source)
            .with_context(|| format!("failed to read candidates from {source}"))?
    };
    serde_json::from_str(&raw).context("candidates must be a JSON array of {name, score}")
}

/// Shortlists the earned names and writes them into the pool.
pub async fn assign(coordinator: CoordinatorConfig, args: AssignArgs) -> anyhow::Result<u8> {
    let candidates = read_candidates(&args.candidates)?;
    let budget = names_earned(args.revenue, args.goal);
    let names = shortlist(&candidates, budget);
    tracing::info!(
        candidates = candidates.len(),
        budget,
        ?names,
        "shortlisted names"
    );

    let notice = match &args.notice_template {
        Some(path) => Notice::parse(
            &std::fs::read_to_string(path)
                .with_context(|| format!("failed to read notice template {}", path.display()))?,
        ),
        None => Notice::default(),
    };

    if names.is_empty() {
        return Ok(EXIT_OK);
    }

    let backend = Backend::open(&coordinator.session.connect)?;
    let session = backend.connect(&coordinator.session).await?;
    backend
        .seed(&*session, &coordinator.layout, &coordinator.seed_slots)
        .await?;

    let assigner = Assigner::new(Arc::clone(&session), coordinator.layout);
    let assignments = assigner.assign_all(&names).await?;
    telemetry::increment_assignments(assignments.len() as u64);
    if assignments.len() < names.len() {
        tracing::warn!(
            unassigned = names.len() - assignments.len(),
            "pool is empty, some names were not assigned"
        );
    }
    print_assignments(&assignments, &notice)?;

    session.close().await?;
    Ok(EXIT_OK)
}

/// Prints the published name, or nothing.
pub fn current(args: CurrentArgs) -> u8 {
    if let Some(name) = read_published_name(&args.name_file) {
        println!("{name}");
    }
    EXIT_OK
}

/// Runs a fleet of claimants and an assigner against one in-process service.
pub async fn demo(coordinator: CoordinatorConfig, args: DemoArgs) -> anyhow::Result<u8> {
    if args.claimants == 0 {
        bail!("--claimants must be greater than 0");
    }
    let layout = coordinator.layout.clone();
    let backend = Backend::Memory(MemoryEnsemble::new());
    let admin = backend.connect(&coordinator.session).await?;
    backend.seed(&*admin, &layout, &args.slots).await?;

    let scratch = tempfile::tempdir().context("failed to create a scratch directory")?;
    let dir = args
        .dir
        .clone()
        .unwrap_or_else(|| scratch.path().to_path_buf());
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(shutdown_signal(shutdown.clone()));

    let mut fleet = Vec::with_capacity(args.claimants);
    for i in 0..args.claimants {
        let identity = format!("demo-{i}");
        let mut config = ClaimConfig::new(identity.as_str());
        config.layout = layout.clone();
        config.admission_timeout = Duration::from_secs(1);
        config.scan_backoff = Duration::from_millis(200);

        let claimant = Arc::new(Claimant::new(
            backend.connect(&coordinator.session).await?,
            config,
            NamePublisher::new(dir.join(format!("{identity}.name"))),
        ));
        let task = {
            let claimant = Arc::clone(&claimant);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { claimant.run(shutdown).await })
        };
        fleet.push((claimant, task));
    }

    let expected = args.claimants.min(args.slots.len());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !shutdown.is_cancelled() && tokio::time::Instant::now() < deadline {
        let holding = fleet
            .iter()
            .filter(|(claimant, _)| claimant.state().holding().is_some())
            .count();
        if holding >= expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let assigner = Assigner::new(Arc::clone(&admin), layout);
    let assignments = assigner.assign_all(&args.names).await?;
    telemetry::increment_assignments(assignments.len() as u64);
    print_assignments(&assignments, &Notice::default())?;

    // Give the holders' watches a moment to publish.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for (claimant, _) in &fleet {
        let state = claimant.state();
        let line = serde_json::json!({
            "identity": claimant.config().identity,
            "state": state_label(&state),
            "slot": state.holding(),
            "published": read_published_name(claimant.publisher().path()),
        });
        println!("{line}");
    }

    shutdown.cancel();
    let outcomes =
        futures::future::join_all(fleet.into_iter().map(|(_, task)| task)).await;
    if let Err(e) = signals.await {
        tracing::error!(error = %e, "signal task failed");
    }
    admin.close().await?;

    let mut failed = 0;
    for outcome in outcomes {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failed += 1;
                tracing::error!(error = %e, "demo claimant failed");
            }
            Err(e) => {
                failed += 1;
                tracing::error!(error = %e, "demo claimant panicked");
            }
        }
    }
    Ok(if failed == 0 { EXIT_OK } else { EXIT_FAILURE })
}
