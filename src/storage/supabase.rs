//! Supabase (PostgREST) implementation of [`Persistence`].

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use serde_json::Value;

use super::{Filter, Persistence, Query, Table};
use crate::error::{Error, Result};
use crate::types::Row;

const COLLABORATOR: &str = "supabase";

pub struct SupabaseStore {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl SupabaseStore {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn table_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table.name())
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let resp = self
            .authed(request)
            .send()
            .await
            .map_err(|e| Error::unavailable(COLLABORATOR, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::unavailable(
                COLLABORATOR,
                format!("HTTP {status}: {body}"),
            ));
        }
        Ok(resp)
    }

    async fn rows(resp: Response) -> Result<Vec<Row>> {
        let values: Vec<Value> = resp.json().await.map_err(|e| Error::Decode {
            kind: "supabase response",
            message: e.to_string(),
        })?;
        Ok(values
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect())
    }
}

/// PostgREST literal for a filter value
fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Query-string parameters for a [`Query`]
fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];
    for filter in &query.filters {
        match filter {
            Filter::Eq(column, value) => {
                params.push((column.clone(), format!("eq.{}", literal(value))));
            }
        }
    }
    if let Some(order) = &query.order {
        let dir = if order.descending { "desc" } else { "asc" };
        params.push(("order".to_string(), format!("{}.{dir}", order.column)));
    }
    params
}

#[async_trait]
impl Persistence for SupabaseStore {
    async fn get(&self, table: Table, id: &str) -> Result<Option<Row>> {
        let params = [
            ("select", "*".to_string()),
            (table.key(), format!("eq.{id}")),
            ("limit", "1".to_string()),
        ];
        let resp = self
            .send(self.http.get(self.table_url(table)).query(&params))
            .await?;
        Ok(Self::rows(resp).await?.into_iter().next())
    }

    async fn query(&self, table: Table, query: &Query) -> Result<Vec<Row>> {
        let resp = self
            .send(
                self.http
                    .get(self.table_url(table))
                    .query(&query_params(query)),
            )
            .await?;
        Self::rows(resp).await
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row> {
        let resp = self
            .send(
                self.http
                    .post(self.table_url(table))
                    .header("Prefer", "return=representation")
                    .json(&[Value::Object(row.clone())]),
            )
            .await?;
        Ok(Self::rows(resp).await?.into_iter().next().unwrap_or(row))
    }

    async fn update(&self, table: Table, id: &str, patch: Row) -> Result<()> {
        let resp = self
            .send(
                self.http
                    .patch(self.table_url(table))
                    .query(&[(table.key(), format!("eq.{id}"))])
                    .header("Prefer", "return=representation")
                    .json(&Value::Object(patch)),
            )
            .await?;
        if Self::rows(resp).await?.is_empty() {
            return Err(Error::not_found(table.name(), id));
        }
        Ok(())
    }

    async fn upsert(&self, table: Table, rows: Vec<Row>) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let count = rows.len();
        let body: Vec<Value> = rows.into_iter().map(Value::Object).collect();
        self.send(
            self.http
                .post(self.table_url(table))
                .query(&[("on_conflict", table.key())])
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&body),
        )
        .await?;
        Ok(count)
    }

    fn backend_name(&self) -> &'static str {
        "supabase"
    }
}
