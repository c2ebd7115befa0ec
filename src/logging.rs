use tracing_subscriber::EnvFilter;

use crate::util::env::env_opt;

/// Noisy dependencies held at `warn` unless `RUST_LOG` names them.
const QUIET_TARGETS: &[&str] = &["sqlx=warn", "hyper=warn", "reqwest=warn", "actix_server=warn"];

fn build_filter(default_filter: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let mut directives = vec![default_filter.to_string()];
    for quiet in QUIET_TARGETS {
        let target = quiet.split('=').next().unwrap_or(*quiet);
        if !default_filter.contains(target) {
            directives.push((*quiet).to_string());
        }
    }
    EnvFilter::new(directives.join(","))
}

/// Install the process-wide subscriber for a binary.
///
/// `RUST_LOG` overrides `default_filter`. `LOG_FORMAT=compact` switches to the
/// single-line format (handy for cron output); the default keeps file and line.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let filter = build_filter(default_filter);
    let compact = env_opt("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("compact"));

    let result = if compact {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}
