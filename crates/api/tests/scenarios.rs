use http::{Method, Request, Response, StatusCode, header};
use http_body_util::BodyExt;
use micro_api::router::{get, post};
use micro_api::{
    Bind, Context, Json, ProblemConfig, RequestBody, ResponseBody, Router, Server, UploadedFile, WebError,
    handler_fn, handler_in, handler_in_out,
};
use serde::Serialize;
use serde_json::{Value, json};

async fn body_bytes(response: Response<ResponseBody>) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

async fn body_json(response: Response<ResponseBody>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn get_request(uri: &str) -> Request<RequestBody> {
    Request::get(uri).body(RequestBody::empty()).unwrap()
}

#[derive(Debug, Default, Serialize, Bind)]
struct Book {
    #[bind(json = "Name", required, min_length = 4, max_length = 50)]
    #[serde(rename = "Name")]
    name: String,
    #[bind(json = "Price", min = 5, max = 100)]
    #[serde(rename = "Price")]
    price: i64,
}

async fn create_book(_ctx: &mut Context, book: Book) -> Result<Json<Book>, WebError> {
    Ok(Json(book))
}

#[tokio::test]
async fn typed_post_with_validation() {
    let router = Router::builder().route("/books", post(handler_in_out(create_book))).build().unwrap();
    let server = Server::builder().router(router).build().unwrap();

    let post_book = |payload: &'static str| {
        Request::post("/books")
            .header(header::CONTENT_TYPE, "application/json")
            .body(RequestBody::from(payload))
            .unwrap()
    };

    let response = server.dispatch(post_book(r#"{"Name":"abc","Price":10}"#)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error = body_json(response).await;
    assert_eq!(error["code"], 400);
    assert!(error["details"].as_str().unwrap().contains("Name"));

    let response = server.dispatch(post_book(r#"{"Name":"abcd","Price":3}"#)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["details"].as_str().unwrap().contains("Price"));

    let response = server.dispatch(post_book(r#"{"Name":"abcd","Price":10}"#)).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await, json!({"Name": "abcd", "Price": 10}));
}

#[derive(Debug, Default, Bind)]
struct ItemId {
    #[bind(path = "id", query = "id")]
    id: i64,
}

async fn show_item(ctx: &mut Context, item: ItemId) -> Result<(), WebError> {
    ctx.text(StatusCode::OK, item.id.to_string())
}

#[tokio::test]
async fn path_wins_over_query() {
    let router = Router::builder().route("/items/{id:int}", get(handler_in(show_item))).build().unwrap();
    let server = Server::builder().router(router).build().unwrap();

    let response = server.dispatch(get_request("/items/7?id=99")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, "7");

    let response = server.dispatch(get_request("/items/seven")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

async fn beta(ctx: &mut Context) -> Result<(), WebError> {
    ctx.text(StatusCode::OK, "beta")
}

#[tokio::test]
async fn disable_then_enable() {
    let router = Router::builder().route("/beta", get(handler_fn(beta))).build().unwrap();
    let server = Server::builder().router(router).build().unwrap();

    server.router().disable(Method::GET, "/beta").unwrap();
    let response = server.dispatch(get_request("/beta")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let document = body_json(server.dispatch(get_request("/openapi.json")).await).await;
    assert!(document["paths"]["/beta"]["get"].is_object());

    server.router().enable(Method::GET, "/beta").unwrap();
    let response = server.dispatch(get_request("/beta")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, "beta");
    let document = body_json(server.dispatch(get_request("/openapi.json")).await).await;
    assert!(document["paths"]["/beta"]["get"].is_object());
}

async fn ticks(ctx: &mut Context) -> Result<(), WebError> {
    let mut writer = ctx.sse()?;
    for n in 1..=3 {
        writer
            .event("tick", json!({ "n": n }).to_string())
            .await
            .map_err(|e| WebError::internal_server_error(e.to_string()))?;
    }
    Ok(())
}

#[tokio::test]
async fn sse_stream() {
    let router = Router::builder().route("/ticks", get(handler_fn(ticks))).build().unwrap();
    let server = Server::builder().router(router).build().unwrap();

    let response = server.dispatch(get_request("/ticks")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

    let body = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
    let frames: Vec<&str> = body.split_terminator("\n\n").collect();
    assert_eq!(frames.len(), 3);
    for (n, frame) in frames.iter().enumerate() {
        let lines: Vec<&str> = frame.lines().collect();
        let id = lines[0].strip_prefix("id: ").unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
        assert_eq!(lines[1], "event: tick");
        assert_eq!(lines[2], format!("data: {{\"n\":{}}}", n + 1));
    }
}

async fn missing(_ctx: &mut Context) -> Result<(), WebError> {
    Err(WebError::not_found("Not found"))
}

#[tokio::test]
async fn problem_details() {
    let router = Router::builder().route("/things/{id}", get(handler_fn(missing))).build().unwrap();
    let server = Server::builder()
        .router(router)
        .problem_details(
            ProblemConfig::new("https://api.example.com/errors/")
                .include_timestamp(true)
                .custom_field("api_version", "v1"),
        )
        .build()
        .unwrap();

    let response = server.dispatch(get_request("/things/1")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/problem+json");

    let problem = body_json(response).await;
    assert!(problem["type"].as_str().unwrap().starts_with("https://api.example.com/errors/"));
    assert_eq!(problem["title"], "Not Found");
    assert_eq!(problem["status"], 404);
    assert_eq!(problem["detail"], "Not found");
    assert!(problem["timestamp"].is_string());
    assert_eq!(problem["api_version"], "v1");
}

#[derive(Debug, Default, Bind)]
struct NewBrand {
    #[bind(form = "Name", required)]
    name: String,
    #[bind(form = "Tags")]
    tags: Vec<String>,
    #[bind(file = "Logo", required)]
    logo: UploadedFile,
}

async fn upload_brand(ctx: &mut Context, brand: NewBrand) -> Result<(), WebError> {
    let content = brand.logo.bytes().await.map_err(|e| WebError::internal_server_error(e.to_string()))?;
    let seen = json!({
        "name": brand.name,
        "tags": brand.tags,
        "file_name": brand.logo.file_name(),
        "content": String::from_utf8_lossy(&content),
    });
    ctx.json(StatusCode::OK, &seen)
}

#[tokio::test]
async fn multipart_with_file_and_fields() {
    let router = Router::builder().route("/brands", post(handler_in(upload_brand))).build().unwrap();
    let server = Server::builder().router(router).build().unwrap();

    let payload = concat!(
        "--XYZ\r\n",
        "Content-Disposition: form-data; name=\"Name\"\r\n\r\n",
        "x\r\n",
        "--XYZ\r\n",
        "Content-Disposition: form-data; name=\"Tags\"\r\n\r\n",
        "a,b\r\n",
        "--XYZ\r\n",
        "Content-Disposition: form-data; name=\"Logo\"; filename=\"logo.png\"\r\n",
        "Content-Type: image/png\r\n\r\n",
        "PNGDATA\r\n",
        "--XYZ--\r\n",
    );
    let request = Request::post("/brands")
        .header(header::CONTENT_TYPE, "multipart/form-data; boundary=XYZ")
        .body(RequestBody::from(payload))
        .unwrap();

    let response = server.dispatch(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"name": "x", "tags": ["a", "b"], "file_name": "logo.png", "content": "PNGDATA"})
    );
}
