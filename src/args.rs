//! Argument parsing for running from the command line

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use fft_slurper::{capture::Protocol, orchestrator::OrchestratorConfig};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Network sample source (HOST:PORT). TCP connects to it, UDP listens on it.
    /// Without one, "Network Input" falls back to a 440 Hz test tone.
    #[clap(short, long)]
    pub source: Option<SocketAddr>,
    /// Transport for the sample source (tcp or udp)
    #[clap(long, default_value = "tcp")]
    pub protocol: Protocol,
    /// Port for the HTTP control surface
    #[clap(short, long, default_value_t = 8080)]
    #[clap(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,
    /// Address to bind the HTTP control surface to
    #[clap(long, default_value = "0.0.0.0")]
    pub bind: std::net::IpAddr,
    /// Samples per frame, a power of two of at least 384
    #[clap(short, long, default_value_t = fft_slurper::DEFAULT_FFT_SIZE)]
    pub fft_size: usize,
    /// Sample rate of the incoming (or synthesized) signal in Hz
    #[clap(long, default_value_t = fft_slurper::DEFAULT_SAMPLE_RATE)]
    pub sample_rate: u32,
    /// Acquisition cycle period in milliseconds
    #[clap(long, default_value_t = 50)]
    pub period_ms: u64,
    /// Directory recordings are written to
    #[clap(short, long, default_value = "logs")]
    pub log_dir: PathBuf,
    /// Give up on a network read after this many milliseconds
    #[clap(long, default_value_t = 1000)]
    pub read_timeout_ms: u64,
    /// Start with auto-record enabled at this SNR threshold (dB)
    #[clap(long)]
    pub auto_record: Option<f32>,
    /// Disable the chunked container format (container requests record as binary)
    #[clap(long)]
    pub no_container: bool,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

impl Args {
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            fft_size: self.fft_size,
            sample_rate: self.sample_rate,
            period: Duration::from_millis(self.period_ms),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["fft_slurper"]);
        assert_eq!(args.source, None);
        assert_eq!(args.protocol, Protocol::Tcp);
        assert_eq!(args.http_addr(), "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(args.log_dir, PathBuf::from("logs"));
        let config = args.orchestrator_config();
        assert_eq!(config.fft_size, 512);
        assert_eq!(config.period, Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_network_source() {
        let args = Args::parse_from([
            "fft_slurper",
            "--source",
            "127.0.0.1:9000",
            "--protocol",
            "udp",
            "--auto-record",
            "15",
            "--no-container",
        ]);
        assert_eq!(args.source, Some("127.0.0.1:9000".parse::<SocketAddr>().unwrap()));
        assert_eq!(args.protocol, Protocol::Udp);
        assert_eq!(args.auto_record, Some(15.0));
        assert!(args.no_container);
    }

    #[test]
    fn test_rejects_port_zero() {
        assert!(Args::try_parse_from(["fft_slurper", "--port", "0"]).is_err());
    }
}
