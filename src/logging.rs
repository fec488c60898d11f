use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install the global tracing subscriber.
///
/// Events go to stderr so they do not tear through the progress spinner.
/// A subscriber installed earlier stays in place.
pub fn init(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}
