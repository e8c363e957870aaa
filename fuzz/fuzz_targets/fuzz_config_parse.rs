#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Exercise the YAML config parser and the validation pass on arbitrary input
    if let Ok(text) = std::str::from_utf8(data)
        && let Ok(config) = serde_yaml::from_str::<eos::Config>(text)
    {
        let _ = config.validate();
    }
});
