use ballotledger::{Kek, ResultsSigner, SigningKeyProvider};

pub fn command_keygen(_matches: &clap::ArgMatches) {
    let kek = Kek::generate();
    let signer = SigningKeyProvider::generate();
    let secret = signer.secret_hex();
    let signer = ResultsSigner::new(signer);

    println!("kek: {}", kek.to_hex().as_str());
    println!("signing-secret-key: {}", secret.as_str());
    println!("signing-public-key: {}", signer.public_key_hex());
    println!("signing-fingerprint: {}", signer.fingerprint());
}
