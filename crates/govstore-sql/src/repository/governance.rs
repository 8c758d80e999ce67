//! Customers, teams, virtual keys, budgets and rate limits
//!
//! Budgets and rate limits are owned rows: deleting a parent deletes what it
//! owns, and pointing a parent at a different budget or rate limit deletes
//! the one it pointed at before. Ownership itself (exactly one parent per
//! owned row) is checked once per transaction by [`verify_ownership`].

use sqlx::AnyConnection;
use sqlx::any::AnyRow;
use tracing::{debug, info};

use govstore_core::model::{
    Budget, BudgetOwner, Customer, CustomerRecord, Expand, KeyRef, RateLimit, Team, TeamRecord,
    VirtualKey, VirtualKeyRecord,
};
use govstore_core::{Error, Result};

use super::providers::key_ref_from_row;
use super::{col, col_bool, col_timestamp, flag, now, require_row, timestamp};
use crate::error::{DbResultExt, from_json, to_json};

const BUDGETS: &str = "governance_budgets";
const RATE_LIMITS: &str = "governance_rate_limits";
const CUSTOMERS: &str = "governance_customers";
const TEAMS: &str = "governance_teams";
const VIRTUAL_KEYS: &str = "governance_virtual_keys";

// Budgets

const BUDGET_COLUMNS: &str = "id, max_limit, reset_duration, current_usage, last_reset";

fn budget_from_row(row: &AnyRow) -> Result<Budget> {
    Ok(Budget {
        id: col(row, "id")?,
        max_limit: col(row, "max_limit")?,
        reset_duration: col(row, "reset_duration")?,
        current_usage: col(row, "current_usage")?,
        last_reset: col_timestamp(row, "last_reset")?,
    })
}

pub async fn get_budget(conn: &mut AnyConnection, id: &str) -> Result<Budget> {
    find_budget(conn, id)
        .await?
        .ok_or_else(|| Error::not_found("budget", id))
}

async fn find_budget(conn: &mut AnyConnection, id: &str) -> Result<Option<Budget>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM governance_budgets WHERE id = $1",
        BUDGET_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .db_context(&format!("Failed to query budget {}", id))?;
    row.as_ref().map(budget_from_row).transpose()
}

pub async fn get_budgets(conn: &mut AnyConnection) -> Result<Vec<Budget>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM governance_budgets ORDER BY id",
        BUDGET_COLUMNS
    ))
    .fetch_all(&mut *conn)
    .await
    .db_context("Failed to query budgets")?;
    rows.iter().map(budget_from_row).collect()
}

pub async fn insert_budget(conn: &mut AnyConnection, budget: &Budget) -> Result<()> {
    let stamp = now();
    sqlx::query(
        "INSERT INTO governance_budgets (id, max_limit, reset_duration, current_usage, \
         last_reset, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $6)",
    )
    .bind(&budget.id)
    .bind(budget.max_limit)
    .bind(&budget.reset_duration)
    .bind(budget.current_usage)
    .bind(timestamp(&budget.last_reset))
    .bind(stamp)
    .execute(&mut *conn)
    .await
    .db_context(&format!("Failed to insert budget {}", budget.id))?;
    debug!("Created budget {}", budget.id);
    Ok(())
}

pub async fn update_budget(conn: &mut AnyConnection, budget: &Budget) -> Result<()> {
    let updated = sqlx::query(
        "UPDATE governance_budgets SET max_limit = $1, reset_duration = $2, current_usage = $3, \
         last_reset = $4, updated_at = $5 WHERE id = $6",
    )
    .bind(budget.max_limit)
    .bind(&budget.reset_duration)
    .bind(budget.current_usage)
    .bind(timestamp(&budget.last_reset))
    .bind(now())
    .bind(&budget.id)
    .execute(&mut *conn)
    .await
    .db_context(&format!("Failed to update budget {}", budget.id))?
    .rows_affected();
    if updated == 0 {
        return Err(Error::not_found("budget", &budget.id));
    }
    Ok(())
}

pub async fn delete_budget(conn: &mut AnyConnection, id: &str) -> Result<()> {
    detach_budget(conn, id).await?;
    let removed = sqlx::query("DELETE FROM governance_budgets WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to delete budget {}", id))?
        .rows_affected();
    if removed == 0 {
        return Err(Error::not_found("budget", id));
    }
    debug!("Deleted budget {}", id);
    Ok(())
}

/// Clear every reference to a budget before deleting it
async fn detach_budget(conn: &mut AnyConnection, id: &str) -> Result<()> {
    for table in [VIRTUAL_KEYS, TEAMS, CUSTOMERS] {
        sqlx::query(&format!(
            "UPDATE {} SET budget_id = NULL WHERE budget_id = $1",
            table
        ))
        .bind(id)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to detach budget {}", id))?;
    }
    Ok(())
}

/// Delete a budget its parent let go of.
///
/// Called after the parent row is updated or deleted. A budget another
/// parent points at by now has moved, not been released, and is kept;
/// `verify_ownership` judges it at commit.
async fn drop_owned_budget(conn: &mut AnyConnection, id: &str) -> Result<()> {
    let mut holders = 0;
    for table in [VIRTUAL_KEYS, TEAMS, CUSTOMERS] {
        holders += referencing_ids(conn, table, "budget_id", id).await?.len();
    }
    if holders > 0 {
        debug!("Budget {} moved to another owner", id);
        return Ok(());
    }

    sqlx::query("DELETE FROM governance_budgets WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to delete budget {}", id))?;
    debug!("Dropped owned budget {}", id);
    Ok(())
}

// Rate limits

const RATE_LIMIT_COLUMNS: &str = "id, token_max_limit, request_max_limit, reset_duration, \
     token_current_usage, request_current_usage, last_reset";

fn rate_limit_from_row(row: &AnyRow) -> Result<RateLimit> {
    Ok(RateLimit {
        id: col(row, "id")?,
        token_max_limit: col(row, "token_max_limit")?,
        request_max_limit: col(row, "request_max_limit")?,
        reset_duration: col(row, "reset_duration")?,
        token_current_usage: col(row, "token_current_usage")?,
        request_current_usage: col(row, "request_current_usage")?,
        last_reset: col_timestamp(row, "last_reset")?,
    })
}

pub async fn get_rate_limit(conn: &mut AnyConnection, id: &str) -> Result<RateLimit> {
    find_rate_limit(conn, id)
        .await?
        .ok_or_else(|| Error::not_found("rate limit", id))
}

async fn find_rate_limit(conn: &mut AnyConnection, id: &str) -> Result<Option<RateLimit>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM governance_rate_limits WHERE id = $1",
        RATE_LIMIT_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .db_context(&format!("Failed to query rate limit {}", id))?;
    row.as_ref().map(rate_limit_from_row).transpose()
}

pub async fn insert_rate_limit(conn: &mut AnyConnection, limit: &RateLimit) -> Result<()> {
    sqlx::query(
        "INSERT INTO governance_rate_limits (id, token_max_limit, request_max_limit, \
         reset_duration, token_current_usage, request_current_usage, last_reset, created_at, \
         updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)",
    )
    .bind(&limit.id)
    .bind(limit.token_max_limit)
    .bind(limit.request_max_limit)
    .bind(&limit.reset_duration)
    .bind(limit.token_current_usage)
    .bind(limit.request_current_usage)
    .bind(timestamp(&limit.last_reset))
    .bind(now())
    .execute(&mut *conn)
    .await
    .db_context(&format!("Failed to insert rate limit {}", limit.id))?;
    debug!("Created rate limit {}", limit.id);
    Ok(())
}

pub async fn update_rate_limit(conn: &mut AnyConnection, limit: &RateLimit) -> Result<()> {
    let updated = sqlx::query(
        "UPDATE governance_rate_limits SET token_max_limit = $1, request_max_limit = $2, \
         reset_duration = $3, token_current_usage = $4, request_current_usage = $5, \
         last_reset = $6, updated_at = $7 WHERE id = $8",
    )
    .bind(limit.token_max_limit)
    .bind(limit.request_max_limit)
    .bind(&limit.reset_duration)
    .bind(limit.token_current_usage)
    .bind(limit.request_current_usage)
    .bind(timestamp(&limit.last_reset))
    .bind(now())
    .bind(&limit.id)
    .execute(&mut *conn)
    .await
    .db_context(&format!("Failed to update rate limit {}", limit.id))?
    .rows_affected();
    if updated == 0 {
        return Err(Error::not_found("rate limit", &limit.id));
    }
    Ok(())
}

pub async fn delete_rate_limit(conn: &mut AnyConnection, id: &str) -> Result<()> {
    sqlx::query("UPDATE governance_virtual_keys SET rate_limit_id = NULL WHERE rate_limit_id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to detach rate limit {}", id))?;
    let removed = sqlx::query("DELETE FROM governance_rate_limits WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to delete rate limit {}", id))?
        .rows_affected();
    if removed == 0 {
        return Err(Error::not_found("rate limit", id));
    }
    debug!("Deleted rate limit {}", id);
    Ok(())
}

// Customers

fn customer_from_row(row: &AnyRow) -> Result<Customer> {
    Ok(Customer {
        id: col(row, "id")?,
        name: col(row, "name")?,
        budget_id: col(row, "budget_id")?,
    })
}

async fn find_customer(conn: &mut AnyConnection, id: &str) -> Result<Option<Customer>> {
    let row = sqlx::query("SELECT id, name, budget_id FROM governance_customers WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .db_context(&format!("Failed to query customer {}", id))?;
    row.as_ref().map(customer_from_row).transpose()
}

pub async fn get_customer(
    conn: &mut AnyConnection,
    id: &str,
    expand: Expand,
) -> Result<CustomerRecord> {
    let customer = find_customer(conn, id)
        .await?
        .ok_or_else(|| Error::not_found("customer", id))?;
    expand_customer(conn, customer, expand).await
}

pub async fn get_customers(conn: &mut AnyConnection, expand: Expand) -> Result<Vec<CustomerRecord>> {
    let rows = sqlx::query("SELECT id, name, budget_id FROM governance_customers ORDER BY id")
        .fetch_all(&mut *conn)
        .await
        .db_context("Failed to query customers")?;

    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        records.push(expand_customer(conn, customer_from_row(row)?, expand).await?);
    }
    Ok(records)
}

async fn expand_customer(
    conn: &mut AnyConnection,
    customer: Customer,
    expand: Expand,
) -> Result<CustomerRecord> {
    let teams = if expand.teams {
        query_teams(conn, Some(&customer.id)).await?
    } else {
        Vec::new()
    };
    let budget = match (&customer.budget_id, expand.budget) {
        (Some(budget_id), true) => find_budget(conn, budget_id).await?,
        _ => None,
    };
    Ok(CustomerRecord {
        customer,
        teams,
        budget,
    })
}

pub async fn insert_customer(conn: &mut AnyConnection, customer: &Customer) -> Result<()> {
    if let Some(budget_id) = &customer.budget_id {
        require_row(conn, BUDGETS, "budget", budget_id).await?;
    }
    let stamp = now();
    sqlx::query(
        "INSERT INTO governance_customers (id, name, budget_id, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $4)",
    )
    .bind(&customer.id)
    .bind(&customer.name)
    .bind(customer.budget_id.as_deref())
    .bind(stamp)
    .execute(&mut *conn)
    .await
    .db_context(&format!("Failed to insert customer {}", customer.id))?;
    debug!("Created customer {}", customer.id);
    Ok(())
}

pub async fn update_customer(conn: &mut AnyConnection, customer: &Customer) -> Result<()> {
    let previous = find_customer(conn, &customer.id)
        .await?
        .ok_or_else(|| Error::not_found("customer", &customer.id))?;
    if let Some(budget_id) = &customer.budget_id {
        require_row(conn, BUDGETS, "budget", budget_id).await?;
    }

    sqlx::query(
        "UPDATE governance_customers SET name = $1, budget_id = $2, updated_at = $3 WHERE id = $4",
    )
    .bind(&customer.name)
    .bind(customer.budget_id.as_deref())
    .bind(now())
    .bind(&customer.id)
    .execute(&mut *conn)
    .await
    .db_context(&format!("Failed to update customer {}", customer.id))?;

    if let Some(old) = replaced(&previous.budget_id, &customer.budget_id) {
        drop_owned_budget(conn, old).await?;
    }
    Ok(())
}

/// Teams and virtual keys of the customer are detached, not deleted
pub async fn delete_customer(conn: &mut AnyConnection, id: &str) -> Result<()> {
    let customer = find_customer(conn, id)
        .await?
        .ok_or_else(|| Error::not_found("customer", id))?;

    for table in [TEAMS, VIRTUAL_KEYS] {
        sqlx::query(&format!(
            "UPDATE {} SET customer_id = NULL WHERE customer_id = $1",
            table
        ))
        .bind(id)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to detach customer {}", id))?;
    }

    sqlx::query("DELETE FROM governance_customers WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to delete customer {}", id))?;

    if let Some(budget_id) = &customer.budget_id {
        drop_owned_budget(conn, budget_id).await?;
    }
    info!("Deleted customer {}", id);
    Ok(())
}

// Teams

fn team_from_row(row: &AnyRow) -> Result<Team> {
    Ok(Team {
        id: col(row, "id")?,
        name: col(row, "name")?,
        customer_id: col(row, "customer_id")?,
        budget_id: col(row, "budget_id")?,
    })
}

async fn find_team(conn: &mut AnyConnection, id: &str) -> Result<Option<Team>> {
    let row = sqlx::query(
        "SELECT id, name, customer_id, budget_id FROM governance_teams WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .db_context(&format!("Failed to query team {}", id))?;
    row.as_ref().map(team_from_row).transpose()
}

async fn query_teams(conn: &mut AnyConnection, customer_id: Option<&str>) -> Result<Vec<Team>> {
    let rows = match customer_id {
        Some(customer_id) => sqlx::query(
            "SELECT id, name, customer_id, budget_id FROM governance_teams \
             WHERE customer_id = $1 ORDER BY id",
        )
        .bind(customer_id)
        .fetch_all(&mut *conn)
        .await,
        None => sqlx::query(
            "SELECT id, name, customer_id, budget_id FROM governance_teams ORDER BY id",
        )
        .fetch_all(&mut *conn)
        .await,
    }
    .db_context("Failed to query teams")?;
    rows.iter().map(team_from_row).collect()
}

pub async fn get_team(conn: &mut AnyConnection, id: &str, expand: Expand) -> Result<TeamRecord> {
    let team = find_team(conn, id)
        .await?
        .ok_or_else(|| Error::not_found("team", id))?;
    expand_team(conn, team, expand).await
}

pub async fn get_teams(
    conn: &mut AnyConnection,
    customer_id: Option<&str>,
    expand: Expand,
) -> Result<Vec<TeamRecord>> {
    let teams = query_teams(conn, customer_id).await?;
    let mut records = Vec::with_capacity(teams.len());
    for team in teams {
        records.push(expand_team(conn, team, expand).await?);
    }
    Ok(records)
}

async fn expand_team(conn: &mut AnyConnection, team: Team, expand: Expand) -> Result<TeamRecord> {
    let customer = match (&team.customer_id, expand.customer) {
        (Some(customer_id), true) => find_customer(conn, customer_id).await?,
        _ => None,
    };
    let budget = match (&team.budget_id, expand.budget) {
        (Some(budget_id), true) => find_budget(conn, budget_id).await?,
        _ => None,
    };
    Ok(TeamRecord {
        team,
        customer,
        budget,
    })
}

async fn check_team_refs(conn: &mut AnyConnection, team: &Team) -> Result<()> {
    if let Some(customer_id) = &team.customer_id {
        require_row(conn, CUSTOMERS, "customer", customer_id).await?;
    }
    if let Some(budget_id) = &team.budget_id {
        require_row(conn, BUDGETS, "budget", budget_id).await?;
    }
    Ok(())
}

pub async fn insert_team(conn: &mut AnyConnection, team: &Team) -> Result<()> {
    check_team_refs(conn, team).await?;
    sqlx::query(
        "INSERT INTO governance_teams (id, name, customer_id, budget_id, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $5)",
    )
    .bind(&team.id)
    .bind(&team.name)
    .bind(team.customer_id.as_deref())
    .bind(team.budget_id.as_deref())
    .bind(now())
    .execute(&mut *conn)
    .await
    .db_context(&format!("Failed to insert team {}", team.id))?;
    debug!("Created team {}", team.id);
    Ok(())
}

pub async fn update_team(conn: &mut AnyConnection, team: &Team) -> Result<()> {
    let previous = find_team(conn, &team.id)
        .await?
        .ok_or_else(|| Error::not_found("team", &team.id))?;
    check_team_refs(conn, team).await?;

    sqlx::query(
        "UPDATE governance_teams SET name = $1, customer_id = $2, budget_id = $3, \
         updated_at = $4 WHERE id = $5",
    )
    .bind(&team.name)
    .bind(team.customer_id.as_deref())
    .bind(team.budget_id.as_deref())
    .bind(now())
    .bind(&team.id)
    .execute(&mut *conn)
    .await
    .db_context(&format!("Failed to update team {}", team.id))?;

    if let Some(old) = replaced(&previous.budget_id, &team.budget_id) {
        drop_owned_budget(conn, old).await?;
    }
    Ok(())
}

/// Virtual keys of the team are detached, not deleted
pub async fn delete_team(conn: &mut AnyConnection, id: &str) -> Result<()> {
    let team = find_team(conn, id)
        .await?
        .ok_or_else(|| Error::not_found("team", id))?;

    sqlx::query("UPDATE governance_virtual_keys SET team_id = NULL WHERE team_id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to detach team {}", id))?;

    sqlx::query("DELETE FROM governance_teams WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to delete team {}", id))?;

    if let Some(budget_id) = &team.budget_id {
        drop_owned_budget(conn, budget_id).await?;
    }
    info!("Deleted team {}", id);
    Ok(())
}

// Virtual keys

const VIRTUAL_KEY_COLUMNS: &str = "id, name, description, is_active, allowed_models, team_id, \
     customer_id, budget_id, rate_limit_id";

async fn virtual_key_from_row(conn: &mut AnyConnection, row: &AnyRow) -> Result<VirtualKey> {
    let id: String = col(row, "id")?;
    let key_ids = attached_keys(conn, &id)
        .await?
        .into_iter()
        .map(|k| k.key_id)
        .collect();
    Ok(VirtualKey {
        name: col(row, "name")?,
        description: col(row, "description")?,
        is_active: col_bool(row, "is_active")?,
        allowed_models: from_json(&col::<String>(row, "allowed_models")?, "allowed_models")?,
        team_id: col(row, "team_id")?,
        customer_id: col(row, "customer_id")?,
        budget_id: col(row, "budget_id")?,
        rate_limit_id: col(row, "rate_limit_id")?,
        key_ids,
        id,
    })
}

async fn find_virtual_key(conn: &mut AnyConnection, id: &str) -> Result<Option<VirtualKey>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM governance_virtual_keys WHERE id = $1",
        VIRTUAL_KEY_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .db_context(&format!("Failed to query virtual key {}", id))?;
    match row {
        Some(row) => Ok(Some(virtual_key_from_row(conn, &row).await?)),
        None => Ok(None),
    }
}

/// Projected view of the keys attached to a virtual key, in submission order
async fn attached_keys(conn: &mut AnyConnection, virtual_key_id: &str) -> Result<Vec<KeyRef>> {
    let rows = sqlx::query(
        "SELECT k.id, k.key_id, k.models FROM governance_virtual_key_keys a \
         JOIN config_keys k ON k.id = a.key_row_id \
         WHERE a.virtual_key_id = $1 ORDER BY a.key_position, k.id",
    )
    .bind(virtual_key_id)
    .fetch_all(&mut *conn)
    .await
    .db_context(&format!("Failed to query keys of virtual key {}", virtual_key_id))?;
    rows.iter().map(key_ref_from_row).collect()
}

pub async fn get_virtual_key(
    conn: &mut AnyConnection,
    id: &str,
    expand: Expand,
) -> Result<VirtualKeyRecord> {
    let virtual_key = find_virtual_key(conn, id)
        .await?
        .ok_or_else(|| Error::not_found("virtual key", id))?;
    expand_virtual_key(conn, virtual_key, expand).await
}

pub async fn get_virtual_keys(
    conn: &mut AnyConnection,
    expand: Expand,
) -> Result<Vec<VirtualKeyRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM governance_virtual_keys ORDER BY id",
        VIRTUAL_KEY_COLUMNS
    ))
    .fetch_all(&mut *conn)
    .await
    .db_context("Failed to query virtual keys")?;

    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        let virtual_key = virtual_key_from_row(conn, row).await?;
        records.push(expand_virtual_key(conn, virtual_key, expand).await?);
    }
    Ok(records)
}

async fn expand_virtual_key(
    conn: &mut AnyConnection,
    virtual_key: VirtualKey,
    expand: Expand,
) -> Result<VirtualKeyRecord> {
    let team = match (&virtual_key.team_id, expand.team) {
        (Some(team_id), true) => find_team(conn, team_id).await?,
        _ => None,
    };
    let customer = match (&virtual_key.customer_id, expand.customer) {
        (Some(customer_id), true) => find_customer(conn, customer_id).await?,
        _ => None,
    };
    let budget = match (&virtual_key.budget_id, expand.budget) {
        (Some(budget_id), true) => find_budget(conn, budget_id).await?,
        _ => None,
    };
    let rate_limit = match (&virtual_key.rate_limit_id, expand.rate_limit) {
        (Some(rate_limit_id), true) => find_rate_limit(conn, rate_limit_id).await?,
        _ => None,
    };
    let keys = if expand.keys {
        attached_keys(conn, &virtual_key.id).await?
    } else {
        Vec::new()
    };
    Ok(VirtualKeyRecord {
        virtual_key,
        team,
        customer,
        budget,
        rate_limit,
        keys,
    })
}

async fn check_virtual_key_refs(conn: &mut AnyConnection, virtual_key: &VirtualKey) -> Result<()> {
    if let Some(team_id) = &virtual_key.team_id {
        require_row(conn, TEAMS, "team", team_id).await?;
    }
    if let Some(customer_id) = &virtual_key.customer_id {
        require_row(conn, CUSTOMERS, "customer", customer_id).await?;
    }
    if let Some(budget_id) = &virtual_key.budget_id {
        require_row(conn, BUDGETS, "budget", budget_id).await?;
    }
    if let Some(rate_limit_id) = &virtual_key.rate_limit_id {
        require_row(conn, RATE_LIMITS, "rate limit", rate_limit_id).await?;
    }
    Ok(())
}

/// Attach the submitted natural key ids; any unknown id is `NotFound`
async fn attach_keys(conn: &mut AnyConnection, virtual_key_id: &str, key_ids: &[String]) -> Result<()> {
    let keys = super::providers::keys_by_ids(conn, key_ids).await?;
    for (position, key) in keys.iter().enumerate() {
        sqlx::query(
            "INSERT INTO governance_virtual_key_keys (virtual_key_id, key_row_id, key_position) \
             VALUES ($1, $2, $3)",
        )
        .bind(virtual_key_id)
        .bind(key.row_id)
        .bind(position as i64)
        .execute(&mut *conn)
        .await
        .db_context(&format!(
            "Failed to attach key {} to virtual key {}",
            key.key_id, virtual_key_id
        ))?;
    }
    Ok(())
}

async fn clear_keys(conn: &mut AnyConnection, virtual_key_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM governance_virtual_key_keys WHERE virtual_key_id = $1")
        .bind(virtual_key_id)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to clear keys of virtual key {}", virtual_key_id))?;
    Ok(())
}

pub async fn insert_virtual_key(conn: &mut AnyConnection, virtual_key: &VirtualKey) -> Result<()> {
    check_virtual_key_refs(conn, virtual_key).await?;
    sqlx::query(
        "INSERT INTO governance_virtual_keys (id, name, description, is_active, allowed_models, \
         team_id, customer_id, budget_id, rate_limit_id, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)",
    )
    .bind(&virtual_key.id)
    .bind(&virtual_key.name)
    .bind(&virtual_key.description)
    .bind(flag(virtual_key.is_active))
    .bind(to_json(&virtual_key.allowed_models)?)
    .bind(virtual_key.team_id.as_deref())
    .bind(virtual_key.customer_id.as_deref())
    .bind(virtual_key.budget_id.as_deref())
    .bind(virtual_key.rate_limit_id.as_deref())
    .bind(now())
    .execute(&mut *conn)
    .await
    .db_context(&format!("Failed to insert virtual key {}", virtual_key.id))?;

    attach_keys(conn, &virtual_key.id, &virtual_key.key_ids).await?;
    debug!(
        "Created virtual key {} with {} keys",
        virtual_key.id,
        virtual_key.key_ids.len()
    );
    Ok(())
}

/// Update the row, then clear and re-attach the key set
pub async fn update_virtual_key(conn: &mut AnyConnection, virtual_key: &VirtualKey) -> Result<()> {
    let previous = find_virtual_key(conn, &virtual_key.id)
        .await?
        .ok_or_else(|| Error::not_found("virtual key", &virtual_key.id))?;
    check_virtual_key_refs(conn, virtual_key).await?;

    sqlx::query(
        "UPDATE governance_virtual_keys SET name = $1, description = $2, is_active = $3, \
         allowed_models = $4, team_id = $5, customer_id = $6, budget_id = $7, \
         rate_limit_id = $8, updated_at = $9 WHERE id = $10",
    )
    .bind(&virtual_key.name)
    .bind(&virtual_key.description)
    .bind(flag(virtual_key.is_active))
    .bind(to_json(&virtual_key.allowed_models)?)
    .bind(virtual_key.team_id.as_deref())
    .bind(virtual_key.customer_id.as_deref())
    .bind(virtual_key.budget_id.as_deref())
    .bind(virtual_key.rate_limit_id.as_deref())
    .bind(now())
    .bind(&virtual_key.id)
    .execute(&mut *conn)
    .await
    .db_context(&format!("Failed to update virtual key {}", virtual_key.id))?;

    clear_keys(conn, &virtual_key.id).await?;
    attach_keys(conn, &virtual_key.id, &virtual_key.key_ids).await?;

    if let Some(old) = replaced(&previous.budget_id, &virtual_key.budget_id) {
        drop_owned_budget(conn, old).await?;
    }
    if let Some(old) = replaced(&previous.rate_limit_id, &virtual_key.rate_limit_id) {
        drop_owned_rate_limit(conn, old).await?;
    }
    Ok(())
}

/// Removes the key associations and the owned budget and rate limit; the
/// provider keys themselves stay
pub async fn delete_virtual_key(conn: &mut AnyConnection, id: &str) -> Result<()> {
    let virtual_key = find_virtual_key(conn, id)
        .await?
        .ok_or_else(|| Error::not_found("virtual key", id))?;

    clear_keys(conn, id).await?;
    sqlx::query("DELETE FROM governance_virtual_keys WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to delete virtual key {}", id))?;

    if let Some(budget_id) = &virtual_key.budget_id {
        drop_owned_budget(conn, budget_id).await?;
    }
    if let Some(rate_limit_id) = &virtual_key.rate_limit_id {
        drop_owned_rate_limit(conn, rate_limit_id).await?;
    }
    info!("Deleted virtual key {}", id);
    Ok(())
}

/// Same rule as [`drop_owned_budget`], with virtual keys as the only owners
async fn drop_owned_rate_limit(conn: &mut AnyConnection, id: &str) -> Result<()> {
    if !referencing_ids(conn, VIRTUAL_KEYS, "rate_limit_id", id)
        .await?
        .is_empty()
    {
        debug!("Rate limit {} moved to another virtual key", id);
        return Ok(());
    }

    sqlx::query("DELETE FROM governance_rate_limits WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to delete rate limit {}", id))?;
    debug!("Dropped owned rate limit {}", id);
    Ok(())
}

/// The previous reference when it is being replaced or cleared
fn replaced<'a>(previous: &'a Option<String>, next: &Option<String>) -> Option<&'a str> {
    match previous {
        Some(old) if next.as_deref() != Some(old.as_str()) => Some(old),
        _ => None,
    }
}

// Ownership

async fn referencing_ids(
    conn: &mut AnyConnection,
    table: &str,
    column: &str,
    id: &str,
) -> Result<Vec<String>> {
    sqlx::query_scalar(&format!(
        "SELECT id FROM {} WHERE {} = $1 ORDER BY id",
        table, column
    ))
    .bind(id)
    .fetch_all(&mut *conn)
    .await
    .db_context(&format!("Failed to resolve owners of {}", id))
}

/// Every budget must be referenced by exactly one virtual key, team or
/// customer, and every rate limit by exactly one virtual key.
pub async fn verify_ownership(conn: &mut AnyConnection) -> Result<()> {
    let budgets: Vec<String> = sqlx::query_scalar(
        "SELECT b.id FROM governance_budgets b WHERE \
         (SELECT COUNT(*) FROM governance_virtual_keys v WHERE v.budget_id = b.id) + \
         (SELECT COUNT(*) FROM governance_teams t WHERE t.budget_id = b.id) + \
         (SELECT COUNT(*) FROM governance_customers c WHERE c.budget_id = b.id) <> 1 \
         ORDER BY b.id",
    )
    .fetch_all(&mut *conn)
    .await
    .db_context("Failed to verify budget ownership")?;

    if let Some(budget_id) = budgets.first() {
        let virtual_keys = referencing_ids(conn, VIRTUAL_KEYS, "budget_id", budget_id).await?;
        let teams = referencing_ids(conn, TEAMS, "budget_id", budget_id).await?;
        let customers = referencing_ids(conn, CUSTOMERS, "budget_id", budget_id).await?;
        BudgetOwner::from_references(budget_id, &virtual_keys, &teams, &customers)?;
    }

    let rate_limits: Vec<String> = sqlx::query_scalar(
        "SELECT r.id FROM governance_rate_limits r WHERE \
         (SELECT COUNT(*) FROM governance_virtual_keys v WHERE v.rate_limit_id = r.id) <> 1 \
         ORDER BY r.id",
    )
    .fetch_all(&mut *conn)
    .await
    .db_context("Failed to verify rate limit ownership")?;

    if let Some(rate_limit_id) = rate_limits.first() {
        let owners = referencing_ids(conn, VIRTUAL_KEYS, "rate_limit_id", rate_limit_id).await?;
        return Err(Error::Conflict(format!(
            "Rate limit {} must be owned by exactly one virtual key (found {})",
            rate_limit_id,
            owners.len()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replaced_reference() {
        let old = Some("b1".to_string());
        assert_eq!(replaced(&old, &Some("b2".to_string())), Some("b1"));
        assert_eq!(replaced(&old, &None), Some("b1"));
        assert_eq!(replaced(&old, &Some("b1".to_string())), None);
        assert_eq!(replaced(&None, &Some("b1".to_string())), None);
    }
}
