use ballotledger::{Config, ResultsSigner, SignedBundle, SigningKeyProvider};
use ed25519_dalek::PublicKey;

pub fn command_sign(matches: &clap::ArgMatches, config: &Config) {
    let file_bytes = crate::read_input("sign", matches);

    let bundle: serde_json::Value = serde_json::from_slice(&file_bytes).unwrap_or_else(|e| {
        eprintln!("ballotledger sign: invalid JSON: {}", e);
        std::process::exit(1);
    });

    let provider = SigningKeyProvider::load_or_create(&config.signing_key_path).unwrap_or_else(|e| {
        eprintln!("ballotledger sign: {}", e);
        std::process::exit(1);
    });
    let signer = ResultsSigner::new(provider);

    let signed = signer.sign_bundle(&bundle).unwrap_or_else(|e| {
        eprintln!("ballotledger sign: {}", e);
        std::process::exit(1);
    });

    println!("{}", serde_json::to_string_pretty(&signed).unwrap());
}

pub fn command_verify(matches: &clap::ArgMatches) {
    let file_bytes = crate::read_input("verify", matches);

    let signed: SignedBundle = serde_json::from_slice(&file_bytes).unwrap_or_else(|e| {
        eprintln!("ballotledger verify: invalid signed bundle: {}", e);
        std::process::exit(1);
    });

    let trusted = match matches.value_of("public-key") {
        Some(key) => {
            let bytes = hex::decode(key.trim()).unwrap_or_else(|_| {
                eprintln!("ballotledger verify: public key is not valid hex");
                std::process::exit(1);
            });
            PublicKey::from_bytes(&bytes).unwrap_or_else(|e| {
                eprintln!("ballotledger verify: invalid public key: {}", e);
                std::process::exit(1);
            })
        }
        None => {
            eprintln!("ballotledger verify: no --public-key given, trusting the embedded key");
            signed.public_key
        }
    };

    let valid = signed.verify_with(&trusted).unwrap_or_else(|e| {
        eprintln!("ballotledger verify: {}", e);
        std::process::exit(1);
    });

    println!("{}", serde_json::json!({ "valid": valid }));
    if !valid {
        std::process::exit(2);
    }
}
