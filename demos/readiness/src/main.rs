use dbvisor::{
    BoundedRetryInstaller, CleanupRegistry, ErrorMarkerDispatcher, InstallRetryConfig, LogFormat,
    ProcessSpec, ProcessSupervisor, init_tracing,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(LogFormat::Text);

    // Kills anything still running if the demo is interrupted.
    let registry = Arc::new(CleanupRegistry::new());
    registry.install_ctrl_c_hook();

    // A one-shot "installer" that needs one retry.
    let marker = std::env::temp_dir().join(format!("dbvisor-demo-{}", std::process::id()));
    let script = format!(
        "if [ -e '{0}' ]; then echo 'Installation complete'; else touch '{0}'; echo 'ERROR: transient failure' >&2; exit 1; fi",
        marker.display()
    );
    let installer = BoundedRetryInstaller::new(
        || {
            let spec = ProcessSpec::builder()
                .executable("/bin/sh")
                .args(["-c", script.as_str()])
                .build()?;
            ProcessSupervisor::new(spec)
        },
        InstallRetryConfig::new(3, Duration::from_secs(10)),
    )?;
    let attempts = installer.run().await?;
    println!("installer finished after {attempts} attempt(s)");
    let _ = std::fs::remove_file(&marker);

    // A "daemon" that logs its chatter to stderr and announces readiness.
    let spec = ProcessSpec::builder()
        .executable("/bin/sh")
        .args([
            "-c",
            "echo 'InnoDB: initializing' >&2; sleep 0.5; echo 'mysqld: ready for connections.' >&2; sleep 60",
        ])
        .build()?;
    let daemon = ProcessSupervisor::new(spec)?
        .with_cleanup_registry(registry.clone())
        .with_log_dispatcher(Arc::new(ErrorMarkerDispatcher::default()));

    let ready = daemon
        .start_and_wait_for_console_message("ready for connections", Duration::from_secs(10))
        .await?;
    println!("ready: {ready}, pid: {:?}", daemon.pid());
    println!("console so far:\n{}", daemon.recent_console_output());

    let exit = daemon.destroy().await?;
    println!("daemon ended with {exit}");

    Ok(())
}
