use sqlx::AnyConnection;
use tracing::info;

use govstore_core::Result;
use govstore_core::model::ModelPricing;

use super::{col, now};
use crate::error::DbResultExt;

pub async fn get_all(conn: &mut AnyConnection) -> Result<Vec<ModelPricing>> {
    let rows = sqlx::query(
        "SELECT model, provider, input_cost_per_token, output_cost_per_token, mode \
         FROM governance_model_pricing ORDER BY provider, model",
    )
    .fetch_all(&mut *conn)
    .await
    .db_context("Failed to query model prices")?;

    rows.iter()
        .map(|row| {
            Ok(ModelPricing {
                model: col(row, "model")?,
                provider: col(row, "provider")?,
                input_cost_per_token: col(row, "input_cost_per_token")?,
                output_cost_per_token: col(row, "output_cost_per_token")?,
                mode: col(row, "mode")?,
            })
        })
        .collect()
}

pub async fn insert(conn: &mut AnyConnection, pricing: &ModelPricing) -> Result<()> {
    sqlx::query(
        "INSERT INTO governance_model_pricing (model, provider, input_cost_per_token, \
         output_cost_per_token, mode, created_at) VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(&pricing.model)
    .bind(&pricing.provider)
    .bind(pricing.input_cost_per_token)
    .bind(pricing.output_cost_per_token)
    .bind(&pricing.mode)
    .bind(now())
    .execute(&mut *conn)
    .await
    .db_context(&format!("Failed to insert pricing for {}", pricing.model))?;
    Ok(())
}

pub async fn delete_all(conn: &mut AnyConnection) -> Result<u64> {
    let removed = sqlx::query("DELETE FROM governance_model_pricing")
        .execute(&mut *conn)
        .await
        .db_context("Failed to delete model prices")?
        .rows_affected();
    info!("Deleted {} model prices", removed);
    Ok(removed)
}
