mod common;

use std::ops::Range;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use cdse::{BaseUrls, Client, Error, FilterValue, Mission, QuerySpec, SearchParameters};
use common::{CutShortServer, PRODUCTS_PATH, config, config_with, token_mock};
use httpmock::Mock;
use httpmock::prelude::*;
use serde_json::{Value, json};
use tracing_test::traced_test;

fn entries(ids: Range<usize>) -> Value {
    let value: Vec<Value> = ids
        .map(|i| json!({"Id": format!("id-{i}"), "Name": format!("S1A_IW_GRDH_{i:03}.SAFE")}))
        .collect();
    json!({ "value": value })
}

/// Catalog page answering exactly `$top`/`$skip`.
fn page(server: &MockServer, top: usize, skip: usize, ids: Range<usize>) -> Mock<'_> {
    server.mock(|when, then| {
        when.method(GET)
            .path(PRODUCTS_PATH)
            .query_param("$top", top.to_string())
            .query_param("$skip", skip.to_string());
        then.status(200).json_body(entries(ids));
    })
}

fn params() -> SearchParameters {
    SearchParameters::between("2024-03-01", "2024-03-31").unwrap()
}

#[test]
fn pages_until_limit_is_reached() -> Result<()> {
    let server = MockServer::start();
    let token = token_mock(&server, "token-1", 600);
    let pages = [
        page(&server, 20, 0, 0..20),
        page(&server, 20, 20, 20..40),
        page(&server, 5, 40, 40..45),
    ];
    let client = Client::with_config(config(&server).with_page_size(20))?;

    let products = client.query(&params().with_limit(45))?;

    assert_eq!(products.len(), 45);
    assert_eq!(products[0].id(), "id-0");
    assert_eq!(products[44].id(), "id-44");
    for page in &pages {
        page.assert_hits(1);
    }
    token.assert_hits(1);
    Ok(())
}

#[test]
fn pages_until_exhausted_without_limit() -> Result<()> {
    let server = MockServer::start();
    token_mock(&server, "token-1", 600);
    let pages = [
        page(&server, 20, 0, 0..20),
        page(&server, 20, 20, 20..40),
        page(&server, 20, 40, 40..45),
    ];
    let client = Client::with_config(config(&server).with_page_size(20))?;

    let products = client.query(&params())?;

    assert_eq!(products.len(), 45);
    for page in &pages {
        page.assert_hits(1);
    }
    Ok(())
}

#[test]
fn request_carries_filter_and_bearer_token() -> Result<()> {
    let server = MockServer::start();
    token_mock(&server, "token-1", 600);
    let search = params()
        .with_mission(Mission::Sentinel1)
        .with_product_type("GRD")
        .with_filter("orbitDirection", "ASCENDING");
    let filter = QuerySpec::build(&search)?.filter();
    assert!(filter.starts_with("Collection/Name eq 'SENTINEL-1' and "), "{filter}");
    let catalog = server.mock(|when, then| {
        when.method(GET)
            .path(PRODUCTS_PATH)
            .header("authorization", "Bearer token-1")
            .query_param("$filter", filter.as_str())
            .query_param("$top", "1000")
            .query_param("$skip", "0")
            .query_param("$expand", "Attributes");
        then.status(200).json_body(entries(0..2));
    });
    let client = Client::with_config(config(&server))?;

    let products = client.query(&search)?;

    assert_eq!(products.len(), 2);
    catalog.assert_hits(1);
    Ok(())
}

#[test]
fn client_errors_are_not_retried() -> Result<()> {
    let server = MockServer::start();
    token_mock(&server, "token-1", 600);
    let catalog = server.mock(|when, then| {
        when.method(GET).path(PRODUCTS_PATH);
        then.status(400)
            .json_body(json!({"detail": {"message": "Invalid filter"}}));
    });
    let client = Client::with_config(config(&server))?;

    let err = client.query(&params()).unwrap_err();
    match err {
        Error::CatalogRequest { status, body, .. } => {
            assert_eq!(status, Some(400));
            assert_eq!(body, "Invalid filter");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    catalog.assert_hits(1);
    Ok(())
}

#[test]
fn transient_errors_are_retried() -> Result<()> {
    let server = MockServer::start();
    token_mock(&server, "token-1", 600);
    let mut outage = server.mock(|when, then| {
        when.method(GET).path(PRODUCTS_PATH);
        then.status(503);
    });
    let client = Client::with_config(config(&server).with_backoff(Duration::from_millis(300)))?;

    // The service recovers while the client is backing off after the first 503.
    let (products, recovered) = thread::scope(|s| {
        let server = &server;
        let recovery = s.spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            while outage.hits() == 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            let recovered = server.mock(|when, then| {
                when.method(GET).path(PRODUCTS_PATH);
                then.status(200).json_body(entries(0..1));
            });
            outage.delete();
            recovered
        });
        let products = client.query(&params());
        (products, recovery.join().unwrap())
    });

    assert_eq!(products?.len(), 1);
    recovered.assert_hits(1);
    Ok(())
}

#[test]
fn persistent_server_errors_surface_after_retries() -> Result<()> {
    let server = MockServer::start();
    token_mock(&server, "token-1", 600);
    let catalog = server.mock(|when, then| {
        when.method(GET).path(PRODUCTS_PATH);
        then.status(503);
    });
    let client = Client::with_config(config(&server).with_max_retries(2))?;

    let err = client.query(&params()).unwrap_err();
    assert!(matches!(err, Error::CatalogRequest { status: Some(503), .. }), "{err:?}");
    catalog.assert_hits(3);
    Ok(())
}

#[test]
fn rejected_token_is_replaced_once() -> Result<()> {
    let server = MockServer::start();
    let token = token_mock(&server, "token-1", 600);
    let catalog = server.mock(|when, then| {
        when.method(GET)
            .path(PRODUCTS_PATH)
            .header("authorization", "Bearer token-1");
        then.status(401);
    });
    let client = Client::with_config(config(&server))?;

    let err = client.query(&params()).unwrap_err();

    assert!(matches!(err, Error::CatalogRequest { status: Some(401), .. }), "{err:?}");
    // One fresh token and one repeat, no loop.
    token.assert_hits(2);
    catalog.assert_hits(2);
    Ok(())
}

#[test]
fn malformed_catalog_response_is_a_parse_error() -> Result<()> {
    let server = MockServer::start();
    token_mock(&server, "token-1", 600);
    server.mock(|when, then| {
        when.method(GET).path(PRODUCTS_PATH);
        then.status(200).json_body(json!({"value": [{"Name": "missing id"}]}));
    });
    let client = Client::with_config(config(&server))?;

    let err = client.query(&params()).unwrap_err();
    assert!(matches!(err, Error::CatalogParse { .. }), "{err:?}");
    Ok(())
}

#[test]
fn truncated_catalog_response_is_read_again() -> Result<()> {
    let server = MockServer::start();
    token_mock(&server, "token-1", 600);
    let catalog = CutShortServer::start("application/json", entries(0..3).to_string().into_bytes());
    let urls = BaseUrls {
        catalog: format!("{}/odata/v1", catalog.url()),
        ..BaseUrls::from_root(&server.base_url())
    };
    let client = Client::with_config(config_with(urls))?;

    let products = client.query(&params())?;

    assert_eq!(products.len(), 3);
    assert_eq!(catalog.hits(), 2);
    Ok(())
}

#[test]
#[traced_test]
fn unlisted_product_type_is_searched_and_known_types_are_logged() {
    let server = MockServer::start();
    token_mock(&server, "token-1", 600);
    let search = params().with_product_type("IW_GRDH_1S");
    let catalog = server.mock(|when, then| {
        when.method(GET)
            .path(PRODUCTS_PATH)
            .query_param("$filter", QuerySpec::build(&search).unwrap().filter());
        then.status(200).json_body(json!({"value": []}));
    });
    let client = Client::with_config(config(&server)).unwrap();

    let products = client.query(&search).unwrap();

    assert!(products.is_empty());
    catalog.assert_hits(1);
    assert!(logs_contain("not among the known product types"));
    assert!(logs_contain("\"GRDM\""));
}

#[test]
fn invalid_parameters_fail_before_any_request() -> Result<()> {
    let server = MockServer::start();
    let token = token_mock(&server, "token-1", 600);
    let catalog = page(&server, 1000, 0, 0..10);
    let client = Client::with_config(config(&server))?;

    let reversed = SearchParameters::between("2024-03-31", "2024-03-01")?;
    assert!(matches!(client.query(&reversed), Err(Error::InvalidQuery(_))));
    let bad_footprint = params().with_footprint("POINT(1 2)");
    assert!(matches!(client.query(&bad_footprint), Err(Error::InvalidQuery(_))));
    let nan = params().with_filter("cloudCover", FilterValue::from(f64::NAN));
    assert!(matches!(client.query(&nan), Err(Error::InvalidQuery(_))));

    token.assert_hits(0);
    catalog.assert_hits(0);
    Ok(())
}
