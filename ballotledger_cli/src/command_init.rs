use ballotledger::{Config, KeyManager, ResultsSigner, SigningKeyProvider};

pub fn command_init_keys(_matches: &clap::ArgMatches, config: &Config) {
    let keys = KeyManager::from_config(config);
    if let Err(e) = keys.get_or_create_active_key() {
        eprintln!(
            "ballotledger init-keys: data key {} at {}: {}",
            keys.key_id(),
            config.wrapped_key_path.display(),
            e
        );
        std::process::exit(1);
    }

    let signer = match SigningKeyProvider::load_or_create(&config.signing_key_path) {
        Ok(provider) => ResultsSigner::new(provider),
        Err(e) => {
            eprintln!(
                "ballotledger init-keys: signing key at {}: {}",
                config.signing_key_path.display(),
                e
            );
            std::process::exit(1);
        }
    };

    println!("data-key-id: {}", keys.key_id());
    println!("wrapped-data-key: {}", config.wrapped_key_path.display());
    println!("signing-key: {}", config.signing_key_path.display());
    println!("signing-public-key: {}", signer.public_key_hex());
    println!("signing-fingerprint: {}", signer.fingerprint());
}
