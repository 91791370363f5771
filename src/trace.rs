use tracing_subscriber::EnvFilter;

/// Build the filter directives for `level`, covering this crate and its
/// workspace libraries.
pub fn levels(level: &str) -> String {
    match level {
        "off" => "off".to_string(),
        level => [
            format!("consul_sd={level}"),
            format!("tripwire={level}"),
            "hyper=warn".to_string(),
            "rustls=warn".to_string(),
        ]
        .join(","),
    }
}

/// Install the global subscriber. Logs go to stderr, stdout carries the
/// discovered targets.
pub fn init(color: bool, json: bool, levels: &str) {
    let filter = match EnvFilter::try_new(levels) {
        Ok(filter) => filter,
        Err(err) => {
            #[allow(clippy::print_stderr)]
            {
                eprintln!("invalid log levels {levels:?}, {err}, fallback to \"info\"");
            }

            EnvFilter::new("info")
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = if json {
        builder.json().flatten_event(true).try_init()
    } else {
        builder.with_ansi(color).try_init()
    };

    // another subscriber is installed already, which only happens in tests
    if let Err(err) = result {
        debug!(message = "global subscriber already installed", %err);
    }
}
