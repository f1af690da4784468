use crate::layer::PublisherLayer;
use crate::publisher::Publisher;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

/// Configuration of the global subscriber installed by this crate.
///
/// **Fields**
/// - `enable_stdout`: if `true`, a `tracing_subscriber::fmt::Layer` is
///   added next to [`PublisherLayer`] so events are also printed to the
///   console.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub enable_stdout: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
        }
    }
}

/// Install a global `tracing` subscriber that feeds `publisher`.
///
/// **Parameters**
/// - `publisher`: the [`Publisher`] receiving every event. It may be
///   initialized before or after this call; events seen while it is not
///   running are ignored.
/// - `config`: [`LayerConfig`] controlling console output.
///
/// **Errors**
///
/// Fails if a global default subscriber was already set.
pub fn init_tracing_with_config(
    publisher: Publisher,
    config: LayerConfig,
) -> Result<(), SetGlobalDefaultError> {
    let layer = PublisherLayer::new(publisher);

    // Two subscriber shapes, since the fmt layer changes the type.
    if config.enable_stdout {
        let fmt_layer = tracing_subscriber::fmt::layer();
        let subscriber = Registry::default().with(layer).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = Registry::default().with(layer);
        tracing::subscriber::set_global_default(subscriber)
    }
}

/// Install the global subscriber with [`LayerConfig::default`].
///
/// This is the recommended entrypoint for typical services.
pub fn init_tracing(publisher: Publisher) -> Result<(), SetGlobalDefaultError> {
    init_tracing_with_config(publisher, LayerConfig::default())
}
