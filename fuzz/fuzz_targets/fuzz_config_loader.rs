#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Fuzz TOML parsing of Config: invalid input must be rejected
    // gracefully, never by panic.
    match toml::from_str::<molder_config::Config>(data) {
        Ok(cfg) => {
            // Ensure validate() does not panic either
            let _ = molder_config::validate(&cfg);
        }
        Err(_e) => {
            // parse error is acceptable
        }
    }
});
