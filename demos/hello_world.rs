use wren_web::{FnHandler, Request, Response, RouteFlags, Router, Server, StatusCode};

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let router = Router::new()
        .add("/", RouteFlags::empty(), FnHandler(hello))
        .add("/echo", RouteFlags::HAS_POST_DATA, FnHandler(echo));

    Server::builder()
        .bind("127.0.0.1:8080")
        .router(router)
        .build()?
        .launch()
}

// GET /?name=you
fn hello(req: &mut Request, resp: &mut Response) -> StatusCode {
    let name = req.query_param(b"name").map(<[u8]>::to_vec);

    resp.write("Hello, ");
    match name {
        Some(name) => resp.write(name),
        None => resp.write("world"),
    };
    resp.write("!\n");

    StatusCode::Ok
}

// POST /echo with any body
fn echo(req: &mut Request, resp: &mut Response) -> StatusCode {
    let mime = req
        .content_type()
        .map(|m| String::from_utf8_lossy(m).into_owned());
    let body = req.body().map(<[u8]>::to_vec);

    if let Some(mime) = mime {
        resp.set_mime_type(mime);
    }
    if let Some(body) = body {
        resp.write(body);
    }

    StatusCode::Ok
}
