//! Fuzz test for configuration file parsing
//!
//! Tests that arbitrary TOML input doesn't cause panics when parsed and
//! validated as dnsd configuration.

#![no_main]

use dnsd_cli::Config;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _: Result<toml::Value, _> = toml::from_str(s);

        // Invalid configs fail here, but never panic
        if let Ok(config) = Config::parse(s) {
            if config.validate().is_ok() {
                let _ = config.server_config();
                let _ = config.build_zones();
            }
        }
    }
});
