//! Built-in applications: `echo`, `text` and `files`.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::service::app::{AppError, AppFuture, Application, Reply, Request};
use crate::service::registry::{AppArgs, LoadError};
use crate::http::body::CHUNK_SIZE;
use crate::http::response::ResponseWriter;

fn string_arg(app: &str, args: &AppArgs, key: &str) -> Result<Option<String>, LoadError> {
    match args.get(key) {
        None => Ok(None),
        Some(toml::Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(LoadError::InvalidArgs {
            app: app.to_string(),
            message: format!("'{key}' must be a string, got {}", other.type_str()),
        }),
    }
}

/// Answers 200 with the request body. The content type is mirrored.
#[derive(Debug, Default)]
pub struct EchoApp;

pub fn echo_factory(_args: &AppArgs) -> Result<Arc<dyn Application>, LoadError> {
    Ok(Arc::new(EchoApp))
}

impl Application for EchoApp {
    fn call<'a>(&'a self, mut request: Request, response: &'a mut ResponseWriter) -> AppFuture<'a> {
        Box::pin(async move {
            let content_type = request
                .environ
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();

            match request.environ.content_length() {
                // Known length: stream it straight back.
                Some(length) => {
                    response.start_response(
                        "200 OK",
                        [
                            ("Content-Type", content_type),
                            ("Content-Length", length.to_string()),
                        ],
                    )?;
                    response.write(&[]).await?;
                    loop {
                        let chunk = request.body.read(Some(CHUNK_SIZE)).await?;
                        if chunk.is_empty() {
                            break;
                        }
                        response.write(&chunk).await?;
                    }
                    Ok(())
                }
                None => {
                    let body = request.body.read_to_end().await?;
                    Reply::ok()
                        .header("Content-Type", content_type)
                        .body(body)
                        .send(response)
                        .await
                }
            }
        })
    }
}

/// Serves a fixed body, taken from `args.body` or read from `args.file`
/// when the factory runs.
#[derive(Debug)]
pub struct TextApp {
    body: Vec<u8>,
    content_type: String,
}

pub fn text_factory(args: &AppArgs) -> Result<Arc<dyn Application>, LoadError> {
    let body = match (string_arg("text", args, "body")?, string_arg("text", args, "file")?) {
        (Some(body), _) => body.into_bytes(),
        (None, Some(file)) => std::fs::read(&file).map_err(|source| LoadError::Io {
            path: PathBuf::from(&file),
            source,
        })?,
        (None, None) => {
            return Err(LoadError::InvalidArgs {
                app: "text".to_string(),
                message: "one of 'body' or 'file' is required".to_string(),
            })
        }
    };
    let content_type = string_arg("text", args, "content_type")?.unwrap_or_else(|| "text/plain".to_string());
    Ok(Arc::new(TextApp { body, content_type }))
}

impl Application for TextApp {
    fn call<'a>(&'a self, _request: Request, response: &'a mut ResponseWriter) -> AppFuture<'a> {
        Box::pin(async move {
            Reply::ok()
                .header("Content-Type", self.content_type.as_str())
                .body(self.body.clone())
                .send(response)
                .await
        })
    }
}

/// Serves files below `args.root`.
#[derive(Debug)]
pub struct FilesApp {
    root: PathBuf,
}

pub fn files_factory(args: &AppArgs) -> Result<Arc<dyn Application>, LoadError> {
    let root = string_arg("files", args, "root")?.ok_or_else(|| LoadError::InvalidArgs {
        app: "files".to_string(),
        message: "'root' is required".to_string(),
    })?;
    let root = PathBuf::from(root);
    if !root.is_dir() {
        return Err(LoadError::InvalidArgs {
            app: "files".to_string(),
            message: format!("root {root:?} is not a directory"),
        });
    }
    Ok(Arc::new(FilesApp { root }))
}

impl FilesApp {
    /// Map `PATH_INFO` below the root. `None` if it tries to climb out.
    fn resolve(&self, path_info: &str) -> Option<PathBuf> {
        let relative = Path::new(path_info.trim_start_matches('/'));
        let mut out = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(out)
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

impl Application for FilesApp {
    fn call<'a>(&'a self, request: Request, response: &'a mut ResponseWriter) -> AppFuture<'a> {
        Box::pin(async move {
            let Some(mut path) = self.resolve(request.environ.path_info()) else {
                return Reply::text("403 Forbidden", "Forbidden").send(response).await;
            };
            if tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
                path.push("index.html");
            }
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Reply::text("404 Not Found", "Not found").send(response).await;
                }
                Err(e) => return Err(AppError::Io(e)),
            };
            let body = if request.environ.method() == "HEAD" {
                Vec::new()
            } else {
                data.clone()
            };
            Reply::ok()
                .header("Content-Type", content_type_for(&path))
                .header("Content-Length", data.len().to_string())
                .body(body)
                .send(response)
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::body::BodyReader;
    use crate::http::environ::Environ;
    use tokio::io::AsyncReadExt;

    async fn run(app: &dyn Application, environ: Environ, body: BodyReader) -> String {
        let (tx, mut rx) = tokio::io::duplex(1 << 16);
        let mut writer = ResponseWriter::new(Box::new(tx), "t");
        app.call(Request { environ, body }, &mut writer).await.unwrap();
        writer.finish().await.unwrap();
        let mut out = String::new();
        rx.read_to_string(&mut out).await.unwrap();
        out
    }

    fn env_with(pairs: &[(&str, &str)]) -> Environ {
        let mut environ = Environ::default();
        for (k, v) in pairs {
            environ.insert(*k, *v);
        }
        environ
    }

    #[tokio::test]
    async fn echo_streams_declared_length() {
        let (mut client, server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, b"llo").await.unwrap();
        let body = BodyReader::new(b"he".to_vec(), Box::new(server), Some(5));
        let environ = env_with(&[("CONTENT_LENGTH", "5"), ("CONTENT_TYPE", "text/x-test")]);
        let out = run(&EchoApp, environ, body).await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Type: text/x-test\r\n"));
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn text_app_from_body_and_file() {
        let mut args = AppArgs::new();
        args.insert("body".to_string(), toml::Value::String("hi there".to_string()));
        let app = text_factory(&args).unwrap();
        let out = run(app.as_ref(), Environ::default(), BodyReader::empty()).await;
        assert!(out.ends_with("hi there"));
        assert!(out.contains("Content-Type: text/plain\r\n"));

        let path = std::env::temp_dir().join(format!("multiserve-text-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, "from file").unwrap();
        let mut args = AppArgs::new();
        args.insert("file".to_string(), toml::Value::String(path.display().to_string()));
        args.insert("content_type".to_string(), toml::Value::String("text/html".to_string()));
        let app = text_factory(&args).unwrap();
        let out = run(app.as_ref(), Environ::default(), BodyReader::empty()).await;
        assert!(out.ends_with("from file"));
        assert!(out.contains("Content-Type: text/html\r\n"));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn text_app_needs_a_body() {
        assert!(matches!(text_factory(&AppArgs::new()), Err(LoadError::InvalidArgs { .. })));
        let mut args = AppArgs::new();
        args.insert("body".to_string(), toml::Value::Integer(3));
        assert!(matches!(text_factory(&args), Err(LoadError::InvalidArgs { .. })));
    }

    #[tokio::test]
    async fn files_app_serves_index_refuses_traversal() {
        let root = std::env::temp_dir().join(format!("multiserve-files-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("index.html"), "<h1>home</h1>").unwrap();
        std::fs::write(root.join("sub/data.json"), "{}").unwrap();

        let mut args = AppArgs::new();
        args.insert("root".to_string(), toml::Value::String(root.display().to_string()));
        let app = files_factory(&args).unwrap();

        let out = run(app.as_ref(), env_with(&[("PATH_INFO", "/")]), BodyReader::empty()).await;
        assert!(out.contains("Content-Type: text/html\r\n"));
        assert!(out.ends_with("<h1>home</h1>"));

        let out = run(app.as_ref(), env_with(&[("PATH_INFO", "/sub/data.json")]), BodyReader::empty()).await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("{}"));

        let out = run(app.as_ref(), env_with(&[("PATH_INFO", "/../etc/passwd")]), BodyReader::empty()).await;
        assert!(out.starts_with("HTTP/1.1 403 Forbidden\r\n"));

        let out = run(app.as_ref(), env_with(&[("PATH_INFO", "/missing.txt")]), BodyReader::empty()).await;
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));

        std::fs::remove_dir_all(&root).unwrap();
    }
}
