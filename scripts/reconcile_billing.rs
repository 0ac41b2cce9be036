#!/usr/bin/env rust-script
//! Billing Reconciliation Script
//!
//! Fixes drift between the denormalized account fields and the subscription
//! records for the GigMatch billing system. The subscription record store is
//! the source of truth; the account columns exist only for fast
//! authorization checks elsewhere in the platform.
//!
//! ## Usage
//! ```bash
//! # Dry run (preview changes without applying)
//! cargo run --bin reconcile_billing --dry-run
//!
//! # Apply fixes
//! cargo run --bin reconcile_billing --apply
//! ```
//!
//! ## Environment Variables
//! - DATABASE_URL: PostgreSQL connection string
//!
//! ## Actions Performed
//! 1. Downgrade accounts with a paid denormalized tier but no entitled
//!    subscription record → free
//! 2. Align account tier with the subscription record's tier
//! 3. Fix has_active_subscription flag mismatches

use std::env;
use std::error::Error;

#[derive(Debug)]
struct ReconciliationAction {
    account_id: uuid::Uuid,
    action_type: String,
    current_state: String,
    new_state: String,
    reason: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    println!("GigMatch Billing Reconciliation");
    println!("================================\n");

    let args: Vec<String> = env::args().collect();
    let dry_run = !args.contains(&"--apply".to_string());

    if dry_run {
        println!("DRY RUN MODE - No changes will be applied");
        println!("Use --apply flag to execute changes\n");
    } else {
        println!("LIVE MODE - Changes will be applied to the database\n");
    }

    dotenvy::dotenv().ok();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = sqlx::postgres::PgPool::connect(&database_url).await?;
    println!("Connected to database\n");

    let mut actions = Vec::new();

    // ========================================================================
    // Action 1: Accounts with a paid tier but no entitled subscription record
    // ========================================================================
    println!("Scanning for paid accounts without entitled subscriptions...");

    let orphaned: Vec<(uuid::Uuid, String)> = sqlx::query_as(
        r#"
        SELECT a.id, a.subscription_tier
        FROM accounts a
        WHERE a.subscription_tier IN ('pro', 'premium')
          AND NOT EXISTS (
              SELECT 1 FROM subscriptions s
              WHERE s.account_id = a.id
                AND s.status IN ('active', 'trialing', 'past_due')
          )
        "#,
    )
    .fetch_all(&pool)
    .await?;

    for (account_id, current_tier) in orphaned {
        actions.push(ReconciliationAction {
            account_id,
            action_type: "DOWNGRADE".to_string(),
            current_state: current_tier,
            new_state: "free".to_string(),
            reason: "No entitled subscription record found".to_string(),
        });
    }

    // ========================================================================
    // Action 2: Account tier disagrees with the subscription record
    // ========================================================================
    println!("Scanning for tier mismatches between accounts and records...");

    let mismatched: Vec<(uuid::Uuid, String, String)> = sqlx::query_as(
        r#"
        SELECT a.id, a.subscription_tier, s.tier
        FROM accounts a
        JOIN subscriptions s ON s.account_id = a.id
        WHERE s.status IN ('active', 'trialing', 'past_due')
          AND a.subscription_tier IS DISTINCT FROM s.tier
        "#,
    )
    .fetch_all(&pool)
    .await?;

    for (account_id, account_tier, record_tier) in mismatched {
        actions.push(ReconciliationAction {
            account_id,
            action_type: "ALIGN_TIER".to_string(),
            current_state: account_tier,
            new_state: record_tier,
            reason: "Account tier disagrees with subscription record".to_string(),
        });
    }

    // ========================================================================
    // Action 3: has_active_subscription flag drift
    // ========================================================================
    println!("Scanning for active-flag mismatches...");

    let flag_drift: Vec<(uuid::Uuid, bool, bool)> = sqlx::query_as(
        r#"
        SELECT a.id,
               a.has_active_subscription,
               COALESCE(s.status IN ('active', 'trialing', 'past_due') AND s.tier <> 'free', FALSE)
        FROM accounts a
        LEFT JOIN subscriptions s ON s.account_id = a.id
        WHERE a.has_active_subscription IS DISTINCT FROM
              COALESCE(s.status IN ('active', 'trialing', 'past_due') AND s.tier <> 'free', FALSE)
        "#,
    )
    .fetch_all(&pool)
    .await?;

    for (account_id, current, expected) in flag_drift {
        actions.push(ReconciliationAction {
            account_id,
            action_type: "FIX_ACTIVE_FLAG".to_string(),
            current_state: current.to_string(),
            new_state: expected.to_string(),
            reason: "has_active_subscription disagrees with subscription record".to_string(),
        });
    }

    // ========================================================================
    // Summary and Execution
    // ========================================================================
    println!("\n========================================");
    println!("Reconciliation Plan");
    println!("========================================\n");

    if actions.is_empty() {
        println!("No reconciliation actions needed!");
        return Ok(());
    }

    println!("Found {} actions to perform:\n", actions.len());

    for (i, action) in actions.iter().enumerate() {
        println!("{}. {} - {}", i + 1, action.action_type, action.account_id);
        println!("   Current: {}", action.current_state);
        println!("   New: {}", action.new_state);
        println!("   Reason: {}", action.reason);
        println!();
    }

    if dry_run {
        println!("This was a dry run. No changes were applied.");
        println!("Run with --apply flag to execute these changes.");
        return Ok(());
    }

    println!("========================================");
    println!("Executing Reconciliation");
    println!("========================================\n");

    for action in &actions {
        match action.action_type.as_str() {
            "DOWNGRADE" => {
                sqlx::query(
                    r#"
                    UPDATE accounts
                    SET subscription_tier = 'free',
                        has_active_subscription = FALSE,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(action.account_id)
                .execute(&pool)
                .await?;
                println!("Downgraded {} to free tier", action.account_id);
            }
            "ALIGN_TIER" => {
                sqlx::query(
                    r#"
                    UPDATE accounts
                    SET subscription_tier = $2, updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(action.account_id)
                .bind(&action.new_state)
                .execute(&pool)
                .await?;
                println!("Aligned tier for {}", action.account_id);
            }
            "FIX_ACTIVE_FLAG" => {
                sqlx::query(
                    r#"
                    UPDATE accounts
                    SET has_active_subscription = $2, updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(action.account_id)
                .bind(action.new_state == "true")
                .execute(&pool)
                .await?;
                println!("Fixed active flag for {}", action.account_id);
            }
            _ => {
                println!("Unknown action type: {}", action.action_type);
            }
        }
    }

    println!("\n========================================");
    println!("Reconciliation Complete");
    println!("========================================");
    println!("Applied {} actions successfully", actions.len());

    Ok(())
}
