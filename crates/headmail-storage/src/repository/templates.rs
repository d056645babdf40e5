//! Template repository

use headmail_common::{Error, Result};

use crate::db::{db_err, Scope};
use crate::models::Template;

/// Template repository
#[derive(Clone, Copy, Default)]
pub struct TemplateRepository;

impl TemplateRepository {
    pub async fn create(&self, scope: &Scope, template: &Template) -> Result<()> {
        let mut conn = scope.conn().await?;
        sqlx::query(
            r#"
            INSERT INTO templates (
                id, name, subject, body_html, body_text, body_mjml, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&template.id)
        .bind(&template.name)
        .bind(&template.subject)
        .bind(&template.body_html)
        .bind(&template.body_text)
        .bind(&template.body_mjml)
        .bind(template.created_at)
        .bind(template.updated_at)
        .execute(conn.as_exec())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get(&self, scope: &Scope, id: &str) -> Result<Template> {
        let mut conn = scope.conn().await?;
        sqlx::query_as::<_, Template>("SELECT * FROM templates WHERE id = $1")
            .bind(id)
            .fetch_optional(conn.as_exec())
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::not_found("template", id))
    }

    pub async fn update(&self, scope: &Scope, template: &Template) -> Result<()> {
        let mut conn = scope.conn().await?;
        let res = sqlx::query(
            r#"
            UPDATE templates SET
                name = $2, subject = $3, body_html = $4, body_text = $5,
                body_mjml = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(&template.id)
        .bind(&template.name)
        .bind(&template.subject)
        .bind(&template.body_html)
        .bind(&template.body_text)
        .bind(&template.body_mjml)
        .bind(template.updated_at)
        .execute(conn.as_exec())
        .await
        .map_err(db_err)?;

        if res.rows_affected() == 0 {
            return Err(Error::not_found("template", template.id.clone()));
        }
        Ok(())
    }

    pub async fn delete(&self, scope: &Scope, id: &str) -> Result<()> {
        let mut conn = scope.conn().await?;
        let res = sqlx::query("DELETE FROM templates WHERE id = $1")
            .bind(id)
            .execute(conn.as_exec())
            .await
            .map_err(db_err)?;

        if res.rows_affected() == 0 {
            return Err(Error::not_found("template", id));
        }
        Ok(())
    }

    pub async fn list(&self, scope: &Scope, offset: i64, limit: i64) -> Result<(Vec<Template>, i64)> {
        let mut conn = scope.conn().await?;
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM templates")
            .fetch_one(conn.as_exec())
            .await
            .map_err(db_err)?;

        let templates = sqlx::query_as::<_, Template>(
            "SELECT * FROM templates ORDER BY created_at DESC OFFSET $1 LIMIT $2",
        )
        .bind(offset)
        .bind(limit)
        .fetch_all(conn.as_exec())
        .await
        .map_err(db_err)?;

        Ok((templates, total))
    }
}
