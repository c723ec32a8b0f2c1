use std::collections::HashMap;
use std::path::PathBuf;

use rusqlite::Connection;

use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" | "PATCH" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub field: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Transport-neutral request. Multipart text fields are folded into `body`
/// as strings; file parts land in `files`.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub bearer: Option<String>,
    pub body: serde_json::Value,
    pub files: Vec<Upload>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: HashMap::new(),
            bearer: None,
            body: serde_json::Value::Null,
            files: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::Put, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.insert(key.to_string(), value.into());
        self
    }

    pub fn with_file(mut self, field: &str, file_name: &str, bytes: Vec<u8>) -> Self {
        self.files.push(Upload {
            field: field.to_string(),
            file_name: file_name.to_string(),
            bytes,
        });
        self
    }

    pub fn file(&self, field: &str) -> Option<&Upload> {
        self.files.iter().find(|f| f.field == field)
    }

    pub fn segments(&self) -> Vec<&str> {
        self.path
            .split('?')
            .next()
            .unwrap_or("")
            .split('/')
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub enum Body {
    Json(serde_json::Value),
    File {
        content_type: &'static str,
        file_name: String,
        bytes: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: Body,
}

impl Response {
    pub fn json(&self) -> &serde_json::Value {
        static NULL: serde_json::Value = serde_json::Value::Null;
        match &self.body {
            Body::Json(v) => v,
            Body::File { .. } => &NULL,
        }
    }
}

pub struct AppState {
    pub config: Config,
    pub db: Connection,
}

impl AppState {
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let db = db::open_db(&config.data_dir)?;
        Ok(Self { config, db })
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.config.data_dir.join("uploads")
    }
}
