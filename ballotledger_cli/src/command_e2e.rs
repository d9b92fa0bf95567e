use ballotledger::*;
use std::sync::Arc;

// Rotating preference orders for the demo voters
const PREFERENCES: [[u32; 3]; 3] = [[2, 1, 3], [1, 2, 3], [3, 1, 2]];

pub fn command_e2e(matches: &clap::ArgMatches) {
    let voters: usize = matches
        .value_of("voters")
        .unwrap_or("5")
        .parse()
        .unwrap_or_else(|_| {
            eprintln!("ballotledger e2e: --voters must be a number");
            std::process::exit(1);
        });

    let dir = tempfile::tempdir().unwrap_or_else(|e| {
        eprintln!("ballotledger e2e: unable to create working directory: {}", e);
        std::process::exit(1);
    });

    if let Err(e) = run(voters, dir.path(), matches.is_present("print-chain")) {
        eprintln!("ballotledger e2e: {}", e);
        std::process::exit(1);
    }
}

fn run(voters: usize, dir: &std::path::Path, print_chain: bool) -> Result<()> {
    let kek_hex = Kek::generate().to_hex();
    let config = Config::from_vars(|name| match name {
        ENV_KEK_HEX => Some(kek_hex.to_string()),
        ENV_WRAPPED_KEY_PATH => Some(dir.join("ballotledger.dek").display().to_string()),
        ENV_SIGNING_KEY_PATH => Some(dir.join("signing.key").display().to_string()),
        ENV_EXPORT_DIR => Some(dir.join("exports").display().to_string()),
        ENV_BACKUP_DIR => Some(dir.join("backup").display().to_string()),
        _ => None,
    })?;

    let store = Arc::new(MemStore::new());
    let keys = Arc::new(KeyManager::from_config(&config));
    let ballot_box = BallotBox::from_config(&config, store.clone(), keys.clone());
    let signer = ResultsSigner::new(SigningKeyProvider::load_or_create(&config.signing_key_path)?);

    println!("> Casting {} ballots", voters);
    for i in 0..voters {
        let token = ballot_box.issue_token(&format!("demo-voter-{}", i))?;
        let prefs = &PREFERENCES[i % PREFERENCES.len()];
        let receipt = ballot_box.submit(Some(token.token.as_str()), "E1", prefs)?;
        println!(
            "  ballot {} receipt {} head {}",
            receipt.ballot_id,
            receipt.receipt,
            &receipt.chain_head[..16]
        );

        // Replays are refused
        if i == 0 {
            let replay = Outcome::from_result(ballot_box.submit(
                Some(token.token.as_str()),
                "E1",
                prefs,
            ))?;
            if let Some(rejection) = replay.rejection() {
                println!("  replayed token refused: {}", rejection.code);
            }
        }
    }

    let report = ballot_box.verify()?;
    let tip = ballot_box.tip()?;
    println!(
        "> Chain height {} tip {} ok={} ({} breaks)",
        tip.height, tip.tip_hash, report.ok, report.total_breaks
    );

    let bundle = ballot_box.results_bundle()?;
    let signed = signer.sign_bundle(&bundle)?;
    println!(
        "> Results signed by {} checksum {} valid={}",
        signer.fingerprint(),
        bundle.checksum()?,
        signed.verify_with(&signer.public_key())?
    );

    let gate = ActionGate::new(&config, store.clone(), keys);
    let engine = ApprovalEngine::new(store.clone(), gate);
    let export = engine.request_for(ActionKind::Export, "admin@example.org", "E1")?;
    for principal in &["alice@example.org", "alice@example.org", "bob@example.org"] {
        match Outcome::from_result(engine.approve(export.id, principal))? {
            Outcome::Accepted(action) => println!("  {} approved: {}", principal, action.status),
            Outcome::Rejected(rejection) => println!("  {} refused: {}", principal, rejection.code),
        }
    }
    println!(
        "> Export written to {}",
        config
            .export_dir
            .join(format!("export_{}.json", export.id))
            .display()
    );

    if print_chain {
        println!("{}", serde_json::to_string_pretty(&store.chain()?)?);
    }

    Ok(())
}
