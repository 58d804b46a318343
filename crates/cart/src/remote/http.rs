//! HTTP client for the storefront cart API.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::{
    config::CartConfig,
    models::{CartItemUuid, CartLineItem, NewCartItem, RemoteCart},
};

use super::{CartApi, CartApiError, RemoteFailure};

const CART_PATH: &str = "/cart";
const CART_ITEMS_PATH: &str = "/cart/items";

/// [`CartApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCartApi {
    base_url: String,
    token: Option<String>,
    http: Client,
}

impl HttpCartApi {
    /// Create a new client from the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &CartConfig) -> Result<Self, CartApiError> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            base_url: config.base_url().to_string(),
            token: config.api_token.clone(),
            http,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{path}", self.base_url));

        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send a request and hand back the body of a successful response.
    async fn send(&self, builder: RequestBuilder) -> Result<Value, CartApiError> {
        let response = builder.send().await?;

        read_body(response).await
    }
}

async fn read_body(response: Response) -> Result<Value, CartApiError> {
    let status = response.status();
    let text = response.text().await?;
    let body = parse_body(&text);

    if !status.is_success() {
        debug!(%status, "cart request rejected");

        return Err(CartApiError::Rejected(RemoteFailure::from_body(
            Some(status.as_u16()),
            &body,
        )));
    }

    Ok(body)
}

fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }

    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

#[derive(Debug, Deserialize)]
struct Acknowledgement<T> {
    #[serde(default = "default_success")]
    success: bool,
    data: Option<T>,
}

fn default_success() -> bool {
    true
}

/// Interpret a `{ success, data?, message? }` body.
fn acknowledge<T: DeserializeOwned>(body: Value) -> Result<Option<T>, CartApiError> {
    if body.is_null() {
        return Ok(None);
    }

    let failure = RemoteFailure::from_body(None, &body);
    let acknowledgement = serde_json::from_value::<Acknowledgement<T>>(body)?;

    if !acknowledgement.success {
        return Err(CartApiError::Rejected(failure));
    }

    Ok(acknowledgement.data)
}

/// Cart bodies arrive either bare or wrapped in `data`.
fn unwrap_data<T: DeserializeOwned>(body: Value) -> Result<T, CartApiError> {
    let body = match body {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };

    Ok(serde_json::from_value(body)?)
}

#[async_trait]
impl CartApi for HttpCartApi {
    #[instrument(skip(self))]
    async fn get_current_cart(&self) -> Result<RemoteCart, CartApiError> {
        let body = self.send(self.request(Method::GET, CART_PATH)).await?;

        unwrap_data(body)
    }

    #[instrument(skip(self, item), fields(product = %item.product_id))]
    async fn add_item(&self, item: NewCartItem) -> Result<CartLineItem, CartApiError> {
        let body = self
            .send(self.request(Method::POST, CART_ITEMS_PATH).json(&item))
            .await?;

        unwrap_data(body)
    }

    #[instrument(skip(self))]
    async fn update_item_quantity(
        &self,
        id: CartItemUuid,
        quantity: u32,
    ) -> Result<Option<CartLineItem>, CartApiError> {
        let body = self
            .send(
                self.request(Method::PATCH, &format!("{CART_ITEMS_PATH}/{id}"))
                    .json(&json!({ "quantity": quantity })),
            )
            .await?;

        acknowledge(body)
    }

    #[instrument(skip(self))]
    async fn remove_item(&self, id: CartItemUuid) -> Result<(), CartApiError> {
        let body = self
            .send(self.request(Method::DELETE, &format!("{CART_ITEMS_PATH}/{id}")))
            .await?;

        acknowledge::<Value>(body).map(|_| ())
    }

    #[instrument(skip(self))]
    async fn clear_cart(&self) -> Result<(), CartApiError> {
        let body = self.send(self.request(Method::DELETE, CART_PATH)).await?;

        acknowledge::<Value>(body).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use crate::{models::ProductUuid, remote::CartErrorKind};

    use super::*;

    #[test]
    fn plain_text_bodies_become_strings() {
        assert_eq!(parse_body("Bad Gateway"), json!("Bad Gateway"));
        assert_eq!(parse_body("  "), Value::Null);
        assert_eq!(parse_body("{\"a\":1}"), json!({ "a": 1 }));
    }

    #[test]
    fn unsuccessful_acknowledgement_is_rejected_with_signals() {
        let body = json!({
            "success": false,
            "message": "Only 2 left",
            "data": { "availableStock": 2 },
        });

        let result = acknowledge::<Value>(body);

        let Err(CartApiError::Rejected(failure)) = result else {
            unreachable!("expected rejection, got {result:?}");
        };

        assert_eq!(failure.message.as_deref(), Some("Only 2 left"));
        assert_eq!(
            failure.kind(),
            CartErrorKind::InsufficientStock { available: 2 }
        );
    }

    #[test]
    fn successful_acknowledgement_returns_data() -> TestResult {
        let item = CartLineItem {
            id: CartItemUuid::now_v7(),
            product_id: ProductUuid::now_v7(),
            product_name: "Phone".to_string(),
            product_image: None,
            quantity: 2,
            unit_price: 100,
            applied_price: None,
            color: None,
            storage: None,
        };

        let body = json!({ "success": true, "data": item });

        let data = acknowledge::<CartLineItem>(body)?;

        assert_eq!(data, Some(item));

        Ok(())
    }

    #[test]
    fn empty_acknowledgement_is_success() -> TestResult {
        assert_eq!(acknowledge::<Value>(Value::Null)?, None);
        assert_eq!(acknowledge::<Value>(json!({ "message": "ok" }))?, None);

        Ok(())
    }

    #[test]
    fn cart_body_may_be_wrapped_in_data() -> TestResult {
        let bare: RemoteCart = unwrap_data(json!({ "items": [] }))?;
        let wrapped: RemoteCart = unwrap_data(json!({ "data": { "items": [] } }))?;

        assert_eq!(bare, wrapped);

        Ok(())
    }

    #[test]
    fn client_builds_from_config() -> TestResult {
        let config = <CartConfig as clap::Parser>::try_parse_from([
            "storefront-cart",
            "--api-url",
            "http://localhost:3000/",
            "--api-token",
            "secret",
        ])?;

        let api = HttpCartApi::new(&config)?;

        assert_eq!(api.base_url, "http://localhost:3000");
        assert_eq!(api.token.as_deref(), Some("secret"));

        Ok(())
    }
}
