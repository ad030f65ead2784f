use std::env;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use bazaar_ledger::{
    AccountStore, Actor, AllocationEngine, CollectionTracker, LedgerStore,
    ReconciliationReporter, Role, RuleTable, SubmissionPool, EVENT_WIDE,
};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("demo") => run_demo()?,
        Some("report") => run_report(args.get(2).map(|s| s.as_str()))?,
        Some("export") => run_export(
            args.get(2).map(|s| s.as_str()),
            args.get(3).map(|s| s.as_str()),
        )?,
        _ => print_usage(),
    }

    Ok(())
}

/// One full season in memory: seed, allocate, sell, collect, submit,
/// confirm, reconcile. Nothing is written to disk.
fn run_demo() -> Result<()> {
    println!("🎪 Bazaar Ledger - Closed-Loop Season Demo");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let store = Arc::new(LedgerStore::open_in_memory()?);
    let accounts = AccountStore::new(store.clone());
    let allocation = AllocationEngine::new(store.clone(), RuleTable::defaults());
    let tracker = CollectionTracker::new(store.clone());
    let pool = SubmissionPool::new(store.clone());
    let reporter = ReconciliationReporter::new(store);

    // 1. People and accounts
    println!("\n👥 Setting up the event...");
    let em_acc = accounts.create_account("maria", Role::EventManager, "ops", 10_000)?;
    let sm_acc = accounts.create_account("jonas", Role::SellerManager, "toys", 0)?;
    let seller_acc = accounts.create_account("lena", Role::Seller, "toys", 0)?;
    println!("✓ Event manager 'maria' seeded with 10000 points");
    println!("✓ Seller manager 'jonas' and seller 'lena' run the toys stand");

    let maria = Actor::new(
        "maria",
        vec![Role::EventManager],
        vec![EVENT_WIDE.to_string()],
    );
    let jonas = Actor::new("jonas", vec![Role::SellerManager], vec!["toys".to_string()]);
    let lena = Actor::new("lena", vec![Role::Seller], vec!["toys".to_string()]);
    let petra = Actor::new("petra", vec![Role::Finance], vec![]);

    // 2. Points flow down the chain
    println!("\n📤 Allocating points down the chain...");
    allocation.allocate(
        &maria,
        &em_acc.id,
        &sm_acc.id,
        2_000,
        Some("toys stand budget".to_string()),
        None,
        None,
    )?;
    let handed_down = allocation.allocate(
        &jonas,
        &sm_acc.id,
        &seller_acc.id,
        500,
        None,
        None,
        None,
    )?;
    println!("✓ maria → jonas: 2000 points");
    println!(
        "✓ jonas → lena: 500 points (lena now holds {})",
        handed_down.to.available_points
    );

    // 3. Sales at the stand
    println!("\n🧸 Selling at the stand...");
    let seller = accounts.record_sale(
        &lena,
        &seller_acc.id,
        450,
        Some("saturday rush".to_string()),
        None,
    )?;
    println!(
        "✓ lena sold for 450 points, {} now waiting to be collected",
        seller.pending_collection
    );

    // 4. Cash pickups
    println!("\n💶 Collecting cash from the seller...");
    let first = tracker.record_collection(&jonas, &sm_acc.id, &seller_acc.id, 300, None)?;
    let second = tracker.record_collection(&jonas, &sm_acc.id, &seller_acc.id, 150, None)?;
    println!(
        "✓ Two pickups, jonas now carries {} in cash",
        second.collector.cash_on_hand
    );

    // 5. Parcel through the finance pool
    println!("\n🏦 Handing the cash to finance...");
    let submission = pool.submit(
        &jonas,
        &sm_acc.id,
        450,
        &[first.collection.id, second.collection.id],
        None,
    )?;
    pool.claim(&petra, &submission.id)?;
    pool.confirm(&petra, &submission.id, Some("counted and banked".to_string()))?;
    println!("✓ Parcel of 450 claimed and confirmed by petra");

    // 6. Close the books
    println!("\n⚖️  Closing the books...");
    let rollup = reporter.event_rollup()?;
    println!("✓ {}", rollup.summary());
    for dept in reporter.department_rollups()? {
        println!("  · {}", dept.summary());
    }
    let audit = reporter.audit()?;
    println!("✓ {}", audit.summary());

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if audit.is_clean() && rollup.is_fully_settled() {
        println!("🎉 Season settled: every point accounted for, every cent confirmed");
    } else {
        println!("⚠️  Books are not fully settled");
    }

    Ok(())
}

fn run_report(db_path: Option<&str>) -> Result<()> {
    let path = db_path.unwrap_or("bazaar.db");

    if !Path::new(path).exists() {
        eprintln!("❌ Database not found: {}", path);
        eprintln!("   Start the server first, or pass an explicit path:");
        eprintln!("   bazaar-ledger report <db-path>");
        std::process::exit(1);
    }

    let store = Arc::new(LedgerStore::open(path)?);
    let reporter = ReconciliationReporter::new(store);

    println!("⚖️  Bazaar Ledger - Reconciliation Report");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let rollup = reporter.event_rollup()?;
    println!("\n{}", rollup.summary());
    for dept in reporter.department_rollups()? {
        println!("  · {}", dept.summary());
    }

    let audit = reporter.audit()?;
    println!("\n{}", audit.summary());
    for disc in &audit.discrepancies {
        println!(
            "  ❌ {} {}: stored {} but the ledger rebuilds {}",
            disc.account_id, disc.field, disc.stored, disc.rebuilt
        );
    }
    for violation in &audit.violations {
        println!("  ❌ {}: {}", violation.rule, violation.detail);
    }

    if audit.is_clean() {
        println!("\n✅ Ledger is clean");
    } else {
        println!("\n⚠️  Ledger needs attention");
    }

    Ok(())
}

fn run_export(db_path: Option<&str>, out_path: Option<&str>) -> Result<()> {
    let (path, out) = match (db_path, out_path) {
        (Some(path), Some(out)) => (path, out),
        _ => {
            eprintln!("❌ Missing arguments!");
            eprintln!("   bazaar-ledger export <db-path> <out.csv>");
            std::process::exit(1);
        }
    };

    if !Path::new(path).exists() {
        eprintln!("❌ Database not found: {}", path);
        std::process::exit(1);
    }

    let store = Arc::new(LedgerStore::open(path)?);
    let reporter = ReconciliationReporter::new(store);

    let file = File::create(out).with_context(|| format!("Failed to create {}", out))?;
    reporter.balances_csv(file)?;

    println!("✅ Balance sheet written to {}", out);

    Ok(())
}

fn print_usage() {
    eprintln!("❌ Unknown or missing command!");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("   bazaar-ledger demo                     Run the in-memory season demo");
    eprintln!("   bazaar-ledger report [db-path]         Rollups plus a full ledger audit");
    eprintln!("   bazaar-ledger export <db-path> <csv>   Write the balance sheet as CSV");
    eprintln!();
    eprintln!("   HTTP API: cargo run --bin ledger-server --features server");
    std::process::exit(1);
}
