//! Demonstration hub with a greeter and a ticker that repeats its greeting.

use std::process::ExitCode;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use switchyard::{
    CancelToken, CancellableRun, ConfigSpec, FieldBinding, InitContext, Initializer, Injected,
    InjectionSource, Provider, ProviderDefinition, ProviderError, ProviderLogger, Registry,
    RegistryError, RunOptions, Runnable,
};

const PROVIDERS: &str = "\
greeter:
  message: hello from switchyard
ticker:
  interval_ms: 1000
";

/// Configuration of [`Greeter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct GreeterConfig {
    message: String,
    loud: bool,
}

impl Default for GreeterConfig {
    fn default() -> Self {
        Self {
            message: "hello".to_owned(),
            loud: false,
        }
    }
}

/// Produces the configured greeting.
#[derive(Default)]
struct Greeter {
    greeting: OnceLock<String>,
}

impl Greeter {
    fn greeting(&self) -> &str {
        self.greeting.get().map_or("", String::as_str)
    }
}

impl Provider for Greeter {
    fn initializer(&self) -> Option<&dyn Initializer> {
        Some(self)
    }
}

impl Initializer for Greeter {
    fn init(&self, context: &InitContext<'_>) -> Result<(), ProviderError> {
        let config = context
            .config_as::<GreeterConfig>()
            .ok_or("greeter configuration is missing")?;
        let greeting = if config.loud {
            config.message.to_uppercase()
        } else {
            config.message.clone()
        };
        context.logger().info(&format!("greeting set to {greeting:?}"));
        self.greeting
            .set(greeting)
            .map_err(|_| "greeter initialised twice")?;
        Ok(())
    }
}

/// Configuration of [`Ticker`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct TickerConfig {
    interval_ms: u64,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

/// Logs the greeter's greeting on every tick until the hub closes.
#[derive(Default)]
struct Ticker {
    logger: OnceLock<ProviderLogger>,
    config: OnceLock<Arc<TickerConfig>>,
    greeter: OnceLock<Arc<Greeter>>,
}

impl Provider for Ticker {
    fn inject(&self, field: &str, value: Injected) -> bool {
        match field {
            "logger" => value
                .into_logger()
                .is_some_and(|logger| self.logger.set(logger).is_ok()),
            "config" => value
                .into_config::<TickerConfig>()
                .is_some_and(|config| self.config.set(config).is_ok()),
            "greeter" => value
                .into_service::<Greeter>()
                .is_some_and(|greeter| self.greeter.set(greeter).is_ok()),
            _ => false,
        }
    }

    fn runnable(&self) -> Option<Runnable<'_>> {
        Some(Runnable::Cancellable(self))
    }
}

impl CancellableRun for Ticker {
    fn run(&self, cancel: &CancelToken) -> Result<(), ProviderError> {
        let (Some(logger), Some(config), Some(greeter)) =
            (self.logger.get(), self.config.get(), self.greeter.get())
        else {
            return Err("ticker was not injected".into());
        };
        let interval = Duration::from_millis(config.interval_ms.max(1));
        let mut ticks: u64 = 0;
        while !cancel.wait_timeout(interval) {
            ticks += 1;
            logger.info(&format!("tick {ticks}: {}", greeter.greeting()));
        }
        logger.info(&format!("stopped after {ticks} ticks"));
        Ok(())
    }
}

fn registry() -> Result<Registry, RegistryError> {
    let mut registry = Registry::new();
    registry.register(
        "greeter",
        ProviderDefinition::new(Greeter::default)
            .with_services(["greeter"])
            .with_description("Builds the greeting")
            .with_config(
                ConfigSpec::of::<GreeterConfig>()
                    .bind(
                        FieldBinding::new("message")
                            .env("DEMO_GREETING")
                            .flag("greeting")
                            .help("Greeting to repeat"),
                    )
                    .bind(FieldBinding::new("loud").flag("loud").help("Shout the greeting")),
            ),
    )?;
    registry.register(
        "ticker",
        ProviderDefinition::new(Ticker::default)
            .with_services(["ticker"])
            .with_description("Logs the greeting periodically")
            .with_config(
                ConfigSpec::of::<TickerConfig>().bind(
                    FieldBinding::new("interval_ms")
                        .flag("interval")
                        .help("Milliseconds between ticks"),
                ),
            )
            .with_injection("logger", InjectionSource::Logger)
            .with_injection("config", InjectionSource::Config)
            .with_injection("greeter", InjectionSource::Service("greeter".to_owned())),
    )?;
    Ok(registry)
}

#[expect(
    clippy::print_stderr,
    reason = "fatal errors are reported on the terminal before exit"
)]
fn main() -> ExitCode {
    let registry = match registry() {
        Ok(registry) => registry,
        Err(error) => {
            eprintln!("switchyard-demo: {error}");
            return ExitCode::FAILURE;
        }
    };
    let options = RunOptions::new("switchyard-demo").with_content(PROVIDERS);
    match switchyard::run(Arc::new(registry), options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("switchyard-demo: {error}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use rstest::rstest;
    use serde_json::json;
    use switchyard::Hub;

    use super::*;

    fn args(extra: &[&str]) -> Vec<OsString> {
        std::iter::once("switchyard-demo")
            .chain(extra.iter().copied())
            .map(OsString::from)
            .collect()
    }

    #[rstest]
    fn ticker_initialises_after_greeter() {
        let hub = Hub::new(Arc::new(registry().expect("demo registry")));

        hub.init(&json!({"ticker": {}, "greeter": {}}), &args(&[]))
            .expect("init succeeds");

        assert_eq!(hub.init_order(), ["greeter", "ticker"]);
    }

    #[rstest]
    fn loud_flag_shouts_the_greeting() {
        let hub = Hub::new(Arc::new(registry().expect("demo registry")));

        hub.init(
            &json!({"greeter": {"message": "hi"}}),
            &args(&["--loud", "true"]),
        )
        .expect("init succeeds");

        let greeter = hub.service_as::<Greeter>("greeter").expect("greeter");
        assert_eq!(greeter.greeting(), "HI");
    }
}
