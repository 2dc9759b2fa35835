//! Integration tests for `OpcUaAssetConnection` against the embedded server.
//!
//! Every test builds a fresh `EmbeddedServer` with the example namespace, so
//! tests are independent and can run in parallel.  They cover:
//!
//! - Round-trips of scalar values through value providers.
//! - Subscription delivery, listener isolation and teardown.
//! - Operation invocation by argument name, with inputs and with inouts.
//! - The lifecycle: all-or-nothing `init`, `close` racing in-flight calls,
//!   lost and recovered transport.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use assetlink_core::{
    ArgumentDescriptor, AssetConnection, AssetConnectionError, ConfigurationError,
    ConnectionState, ContextError, CoreConfig, Datatype, ElementValue, InitError, LangStringSet,
    NewDataListener, OperationVariable, Reference, ServiceContext, StaticServiceContext, TypeInfo,
    TypedValue,
};
use assetlink_opcua::{
    example_node, ArgumentMapping, EmbeddedServer, OpcUaAssetConnection,
    OpcUaAssetConnectionConfig, OpcUaOperationProviderConfig, OpcUaSubscriptionProviderConfig,
    OpcUaValueProviderConfig, Variant,
};
use mockall::mock;
use tokio_test::{assert_err, assert_ok};

const HOST: &str = "opc.tcp://localhost:4840";

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn property(id_short: &str) -> Reference {
    Reference::parse(&format!("(Submodel)urn:example:test, (Property){id_short}")).unwrap()
}

fn operation(id_short: &str) -> Reference {
    Reference::parse(&format!("(Submodel)urn:example:test, (Operation){id_short}")).unwrap()
}

fn value_config(path: &str) -> OpcUaValueProviderConfig {
    OpcUaValueProviderConfig {
        node_id: example_node(path).to_string(),
        array_index: None,
    }
}

fn subscription_config(path: &str, interval_ms: u64) -> OpcUaSubscriptionProviderConfig {
    OpcUaSubscriptionProviderConfig {
        node_id: example_node(path).to_string(),
        interval_ms,
        array_index: None,
    }
}

fn sqrt_config() -> OpcUaOperationProviderConfig {
    OpcUaOperationProviderConfig {
        node_id: example_node("sqrt(x)").to_string(),
        parent_node_id: None,
        input_argument_mapping: vec![],
        output_argument_mapping: vec![],
    }
}

fn sqrt_outputs() -> Vec<ArgumentDescriptor> {
    vec![ArgumentDescriptor::new(
        "x_sqrt",
        TypeInfo::property(Datatype::Double),
    )]
}

async fn open(
    server: &EmbeddedServer,
    config: OpcUaAssetConnectionConfig,
    context: &dyn ServiceContext,
) -> OpcUaAssetConnection {
    let mut connection = OpcUaAssetConnection::new(config).unwrap();
    connection
        .init(&CoreConfig::default(), context, server)
        .await
        .unwrap();
    connection
}

/// Connection with one value provider per entry of `nodes`.
async fn open_values(
    server: &EmbeddedServer,
    nodes: &[(&str, &str, TypeInfo)],
) -> OpcUaAssetConnection {
    let mut config = OpcUaAssetConnectionConfig::new(HOST);
    let mut context = StaticServiceContext::new();
    for (id_short, path, type_info) in nodes {
        config.value_providers.insert(property(id_short), value_config(path));
        context = context.with_type_info(property(id_short), *type_info);
    }
    open(server, config, &context).await
}

/// Listener that records every value it receives.
#[derive(Default)]
struct Recorder {
    values: Mutex<Vec<ElementValue>>,
}

impl Recorder {
    fn count(&self, value: &ElementValue) -> usize {
        self.values.lock().unwrap().iter().filter(|v| *v == value).count()
    }
}

impl NewDataListener for Recorder {
    fn new_data_received(&self, value: &ElementValue) {
        self.values.lock().unwrap().push(value.clone());
    }
}

mock! {
    pub Context {}

    impl ServiceContext for Context {
        fn type_info(&self, reference: &Reference) -> Result<TypeInfo, ContextError>;
        fn operation_output_variables(
            &self,
            reference: &Reference,
        ) -> Result<Vec<ArgumentDescriptor>, ContextError>;
    }
}

// ── Value providers ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_scalar_values_round_trip() {
    // Arrange
    let server = EmbeddedServer::with_example_namespace();
    let cases = [
        ("double", "ScalarTypes/Double", Datatype::Double, TypedValue::Double(3.3)),
        (
            "string",
            "ScalarTypes/String",
            Datatype::String,
            TypedValue::String("hello world!".into()),
        ),
        ("boolean", "ScalarTypes/Boolean", Datatype::Boolean, TypedValue::Boolean(true)),
        ("short", "ScalarTypes/Int16", Datatype::Short, TypedValue::Short(-1234)),
        ("int", "ScalarTypes/Int32", Datatype::Int, TypedValue::Int(123_456)),
        ("long", "ScalarTypes/Int64", Datatype::Long, TypedValue::Long(-9_000_000_000)),
        ("ubyte", "ScalarTypes/Byte", Datatype::UnsignedByte, TypedValue::UnsignedByte(200)),
        ("uint", "ScalarTypes/UInt32", Datatype::UnsignedInt, TypedValue::UnsignedInt(4_000_000_000)),
        ("float", "ScalarTypes/Float", Datatype::Float, TypedValue::Float(1.5)),
    ];
    let nodes: Vec<_> = cases
        .iter()
        .map(|(id, path, datatype, _)| (*id, *path, TypeInfo::property(*datatype)))
        .collect();
    let connection = open_values(&server, &nodes).await;

    for (id_short, _, _, value) in cases {
        let provider = &connection.value_providers()[&property(id_short)];
        let expected = ElementValue::Property(value);

        // Act
        assert_ok!(provider.set_value(&expected).await);
        let actual = assert_ok!(provider.get_value().await);

        // Assert
        assert_eq!(actual, expected, "round trip of {id_short}");
    }
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_two_reads_without_write_are_equal() {
    let server = EmbeddedServer::with_example_namespace();
    let connection = open_values(
        &server,
        &[("labels", "Labels", TypeInfo::MultiLanguageProperty)],
    )
    .await;
    let provider = &connection.value_providers()[&property("labels")];

    let first = provider.get_value().await.unwrap();
    let second = provider.get_value().await.unwrap();

    assert_eq!(first, second);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_multi_language_value_is_keyed_by_language() {
    // Arrange
    let server = EmbeddedServer::with_example_namespace();
    let connection = open_values(
        &server,
        &[("labels", "Labels", TypeInfo::MultiLanguageProperty)],
    )
    .await;
    let provider = &connection.value_providers()[&property("labels")];
    let mut written = LangStringSet::new();
    written.insert("fr", "Vitesse");
    written.insert("en", "Speed");

    // Act
    let initial = provider.get_value().await.unwrap();
    provider
        .set_value(&ElementValue::MultiLanguage(written.clone()))
        .await
        .unwrap();
    let read_back = provider.get_value().await.unwrap();

    // Assert
    let ElementValue::MultiLanguage(initial) = initial else {
        panic!("expected a multi-language value, got {initial:?}");
    };
    assert_eq!(initial.get("de"), Some("Drehzahl"));
    assert_eq!(read_back, ElementValue::MultiLanguage(written));
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_reference_element_is_read_from_key_texts() {
    let server = EmbeddedServer::with_example_namespace();
    let connection =
        open_values(&server, &[("link", "Link", TypeInfo::ReferenceElement)]).await;

    let value = connection.value_providers()[&property("link")]
        .get_value()
        .await
        .unwrap();

    assert_eq!(
        value,
        ElementValue::Reference(
            Reference::parse("(Submodel)urn:example:sensors, (Property)Temperature").unwrap()
        )
    );
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_array_property_and_array_element() {
    // Arrange
    let server = EmbeddedServer::with_example_namespace();
    let mut config = OpcUaAssetConnectionConfig::new(HOST);
    config
        .value_providers
        .insert(property("all"), value_config("ArrayTypes/Double"));
    config.value_providers.insert(
        property("second"),
        OpcUaValueProviderConfig {
            node_id: example_node("ArrayTypes/Double").to_string(),
            array_index: Some("[1]".into()),
        },
    );
    let context = StaticServiceContext::new()
        .with_type_info(property("all"), TypeInfo::array(Datatype::Double))
        .with_type_info(property("second"), TypeInfo::property(Datatype::Double));
    let connection = open(&server, config, &context).await;

    // Act
    connection.value_providers()[&property("second")]
        .set_value(&ElementValue::from(9.5))
        .await
        .unwrap();
    let all = connection.value_providers()[&property("all")]
        .get_value()
        .await
        .unwrap();

    // Assert
    assert_eq!(
        all,
        ElementValue::Property(TypedValue::Array(
            Datatype::Double,
            vec![TypedValue::Double(0.5), TypedValue::Double(9.5)]
        ))
    );
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_range_reads_both_bounds() {
    let server = EmbeddedServer::with_example_namespace();
    let connection = open_values(
        &server,
        &[(
            "range",
            "Range",
            TypeInfo::Range {
                datatype: Datatype::Double,
            },
        )],
    )
    .await;

    let value = connection.value_providers()[&property("range")]
        .get_value()
        .await
        .unwrap();

    assert_eq!(
        value,
        ElementValue::Range {
            min: Some(TypedValue::Double(0.0)),
            max: Some(TypedValue::Double(100.0)),
        }
    );
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_type_mismatch_from_server_is_reported() {
    // The node holds a Double; a boolean cannot be parsed from it.
    let server = EmbeddedServer::with_example_namespace();
    let connection = open_values(
        &server,
        &[("wrong", "ScalarTypes/Double", TypeInfo::property(Datatype::Boolean))],
    )
    .await;

    let err = assert_err!(connection.value_providers()[&property("wrong")].get_value().await);

    assert!(matches!(err, AssetConnectionError::Conversion(_)));
    connection.close().await.unwrap();
}

// ── Subscriptions ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_written_value_is_delivered_exactly_once_within_five_intervals() {
    // Arrange
    let interval = Duration::from_millis(50);
    let server = EmbeddedServer::with_example_namespace();
    let mut config = OpcUaAssetConnectionConfig::new(HOST);
    config
        .value_providers
        .insert(property("temp"), value_config("ScalarTypes/Double"));
    config.subscription_providers.insert(
        property("temp"),
        subscription_config("ScalarTypes/Double", interval.as_millis() as u64),
    );
    let context = StaticServiceContext::new()
        .with_type_info(property("temp"), TypeInfo::property(Datatype::Double));
    let connection = open(&server, config, &context).await;
    // Let the initial sample go by.
    tokio::time::sleep(interval * 2).await;
    let recorder = Arc::new(Recorder::default());
    connection.subscription_providers()[&property("temp")]
        .add_new_data_listener(recorder.clone());
    let written = ElementValue::from(42.5);

    // Act
    connection.value_providers()[&property("temp")]
        .set_value(&written)
        .await
        .unwrap();
    tokio::time::sleep(interval * 5).await;

    // Assert
    assert_eq!(recorder.count(&written), 1);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_panicking_listener_does_not_stop_delivery() {
    // Arrange
    let server = EmbeddedServer::with_example_namespace();
    let node = example_node("ScalarTypes/Int32");
    let mut config = OpcUaAssetConnectionConfig::new(HOST);
    config
        .subscription_providers
        .insert(property("counter"), subscription_config("ScalarTypes/Int32", 10));
    let context = StaticServiceContext::new()
        .with_type_info(property("counter"), TypeInfo::property(Datatype::Int));
    let connection = open(&server, config, &context).await;
    let provider = &connection.subscription_providers()[&property("counter")];
    provider.add_new_data_listener(Arc::new(|_: &ElementValue| panic!("listener failure")));
    let recorder = Arc::new(Recorder::default());
    provider.add_new_data_listener(recorder.clone());

    // Act
    server.set_value(&node, Variant::Int32(1)).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    server.set_value(&node, Variant::Int32(2)).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    // Assert
    assert_eq!(recorder.count(&ElementValue::from(1)), 1);
    assert_eq!(recorder.count(&ElementValue::from(2)), 1);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_unconvertible_sample_does_not_stop_delivery() {
    // Arrange: a Double node read as a Duration in milliseconds
    let server = EmbeddedServer::with_example_namespace();
    let node = example_node("ScalarTypes/Double");
    let mut config = OpcUaAssetConnectionConfig::new(HOST);
    config
        .subscription_providers
        .insert(property("dwell"), subscription_config("ScalarTypes/Double", 10));
    let context = StaticServiceContext::new()
        .with_type_info(property("dwell"), TypeInfo::property(Datatype::Duration));
    let connection = open(&server, config, &context).await;
    let recorder = Arc::new(Recorder::default());
    connection.subscription_providers()[&property("dwell")]
        .add_new_data_listener(recorder.clone());
    let good = ElementValue::Property(TypedValue::Duration(Duration::from_millis(1500)));

    // Act
    server.set_value(&node, Variant::Double(1e300)).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    server.set_value(&node, Variant::Double(1500.0)).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    // Assert
    assert_eq!(recorder.count(&good), 1);
    assert_eq!(server.active_monitored_items(), 1);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_removed_listener_receives_nothing() {
    let server = EmbeddedServer::with_example_namespace();
    let node = example_node("ScalarTypes/Int32");
    let mut config = OpcUaAssetConnectionConfig::new(HOST);
    config
        .subscription_providers
        .insert(property("counter"), subscription_config("ScalarTypes/Int32", 10));
    let context = StaticServiceContext::new()
        .with_type_info(property("counter"), TypeInfo::property(Datatype::Int));
    let connection = open(&server, config, &context).await;
    let provider = &connection.subscription_providers()[&property("counter")];
    let recorder = Arc::new(Recorder::default());
    let listener: Arc<dyn NewDataListener> = recorder.clone();
    provider.add_new_data_listener(Arc::clone(&listener));
    provider.remove_new_data_listener(&listener);

    server.set_value(&node, Variant::Int32(5)).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert!(recorder.values.lock().unwrap().is_empty());
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_no_delivery_after_close() {
    // Arrange
    let server = EmbeddedServer::with_example_namespace();
    let node = example_node("ScalarTypes/Int32");
    let mut config = OpcUaAssetConnectionConfig::new(HOST);
    config
        .subscription_providers
        .insert(property("counter"), subscription_config("ScalarTypes/Int32", 10));
    let context = StaticServiceContext::new()
        .with_type_info(property("counter"), TypeInfo::property(Datatype::Int));
    let connection = open(&server, config, &context).await;
    let recorder = Arc::new(Recorder::default());
    connection.subscription_providers()[&property("counter")]
        .add_new_data_listener(recorder.clone());
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Act
    connection.close().await.unwrap();
    let seen_at_close = recorder.values.lock().unwrap().len();
    server.set_value(&node, Variant::Int32(99)).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    // Assert
    assert_eq!(recorder.values.lock().unwrap().len(), seen_at_close);
    assert_eq!(server.active_monitored_items(), 0);
}

// ── Operations ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sqrt_with_inputs_only() {
    // Arrange
    let server = EmbeddedServer::with_example_namespace();
    let mut config = OpcUaAssetConnectionConfig::new(HOST);
    config.operation_providers.insert(operation("sqrt"), sqrt_config());
    let context = StaticServiceContext::new().with_outputs(operation("sqrt"), sqrt_outputs());
    let connection = open(&server, config, &context).await;

    // Act
    let output = connection.operation_providers()[&operation("sqrt")]
        .invoke(&[OperationVariable::new("x", 4.0)], &mut [])
        .await
        .unwrap();

    // Assert
    assert_eq!(output, vec![OperationVariable::new("x_sqrt", 2.0)]);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_sqrt_with_inout_only_updates_in_place() {
    // Arrange
    let server = EmbeddedServer::with_example_namespace();
    let mut operation_config = sqrt_config();
    operation_config.output_argument_mapping = vec![ArgumentMapping::new("x", "x_sqrt")];
    let mut config = OpcUaAssetConnectionConfig::new(HOST);
    config.operation_providers.insert(operation("sqrt"), operation_config);
    let context = StaticServiceContext::new().with_outputs(operation("sqrt"), sqrt_outputs());
    let connection = open(&server, config, &context).await;
    let mut inoutput = [OperationVariable::new("x", 4.0)];

    // Act
    let output = connection.operation_providers()[&operation("sqrt")]
        .invoke(&[], &mut inoutput)
        .await
        .unwrap();

    // Assert
    assert_eq!(inoutput, [OperationVariable::new("x", 2.0)]);
    assert_eq!(output, vec![OperationVariable::new("x_sqrt", 2.0)]);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_invocations_are_independent() {
    let server = EmbeddedServer::with_example_namespace();
    let mut config = OpcUaAssetConnectionConfig::new(HOST);
    config.operation_providers.insert(operation("sqrt"), sqrt_config());
    let context = StaticServiceContext::new().with_outputs(operation("sqrt"), sqrt_outputs());
    let connection = open(&server, config, &context).await;
    let provider = &connection.operation_providers()[&operation("sqrt")];

    let input_a = [OperationVariable::new("x", 16.0)];
    let input_b = [OperationVariable::new("x", 25.0)];
    let (a, b) = tokio::join!(
        provider.invoke(&input_a, &mut []),
        provider.invoke(&input_b, &mut []),
    );

    assert_eq!(a.unwrap(), vec![OperationVariable::new("x_sqrt", 4.0)]);
    assert_eq!(b.unwrap(), vec![OperationVariable::new("x_sqrt", 5.0)]);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_argument_of_wrong_type_is_rejected() {
    let server = EmbeddedServer::with_example_namespace();
    let mut config = OpcUaAssetConnectionConfig::new(HOST);
    config.operation_providers.insert(operation("sqrt"), sqrt_config());
    let context = StaticServiceContext::new().with_outputs(operation("sqrt"), sqrt_outputs());
    let connection = open(&server, config, &context).await;

    let err = assert_err!(
        connection.operation_providers()[&operation("sqrt")]
            .invoke(&[OperationVariable::new("x", "four")], &mut [])
            .await
    );

    assert!(matches!(err, AssetConnectionError::ArgumentMismatch(_)));
    connection.close().await.unwrap();
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_get_value_after_close_fails() {
    // Arrange
    let server = EmbeddedServer::with_example_namespace();
    let connection = open_values(
        &server,
        &[("temp", "ScalarTypes/Double", TypeInfo::property(Datatype::Double))],
    )
    .await;
    let provider = Arc::clone(&connection.value_providers()[&property("temp")]);

    // Act
    connection.close().await.unwrap();
    let err = assert_err!(provider.get_value().await);

    // Assert
    assert!(matches!(err, AssetConnectionError::Closed));
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(server.open_sessions(), 0);
}

#[tokio::test]
async fn test_init_is_all_or_nothing() {
    // Arrange: value and subscription providers resolve, the operation does not.
    let server = EmbeddedServer::with_example_namespace();
    let mut config = OpcUaAssetConnectionConfig::new(HOST);
    config
        .value_providers
        .insert(property("temp"), value_config("ScalarTypes/Double"));
    config
        .subscription_providers
        .insert(property("temp"), subscription_config("ScalarTypes/Double", 10));
    let mut broken = sqrt_config();
    broken.node_id = example_node("missing(x)").to_string();
    config.operation_providers.insert(operation("missing"), broken);
    let context = StaticServiceContext::new()
        .with_type_info(property("temp"), TypeInfo::property(Datatype::Double))
        .with_outputs(operation("missing"), sqrt_outputs());
    let mut connection = OpcUaAssetConnection::new(config).unwrap();

    // Act
    let result = connection
        .init(&CoreConfig::default(), &context, &server)
        .await;

    // Assert
    assert!(matches!(
        result,
        Err(InitError::Configuration(ConfigurationError::UnresolvableAddress { .. }))
    ));
    assert_eq!(connection.state(), ConnectionState::Uninitialized);
    assert!(connection.value_providers().is_empty());
    assert!(connection.subscription_providers().is_empty());
    assert!(connection.operation_providers().is_empty());
    assert_eq!(server.active_monitored_items(), 0);
    assert_eq!(server.open_sessions(), 0);
}

#[tokio::test]
async fn test_unknown_reference_fails_before_connecting() {
    // Arrange
    let server = EmbeddedServer::with_example_namespace();
    let mut config = OpcUaAssetConnectionConfig::new(HOST);
    config
        .value_providers
        .insert(property("unknown"), value_config("ScalarTypes/Double"));
    let mut context = MockContext::new();
    context
        .expect_type_info()
        .times(1)
        .returning(|r| Err(ContextError::NotFound(r.clone())));
    context.expect_operation_output_variables().never();
    let mut connection = OpcUaAssetConnection::new(config).unwrap();

    // Act
    let result = connection
        .init(&CoreConfig::default(), &context, &server)
        .await;

    // Assert
    assert!(matches!(
        result,
        Err(InitError::Configuration(ConfigurationError::UnresolvedType { .. }))
    ));
    assert_eq!(server.open_sessions(), 0);
}

#[tokio::test]
async fn test_type_info_is_resolved_once_per_reference() {
    let server = EmbeddedServer::with_example_namespace();
    let mut config = OpcUaAssetConnectionConfig::new(HOST);
    config
        .value_providers
        .insert(property("temp"), value_config("ScalarTypes/Double"));
    config
        .subscription_providers
        .insert(property("temp"), subscription_config("ScalarTypes/Double", 100));
    config.operation_providers.insert(operation("sqrt"), sqrt_config());
    let mut context = MockContext::new();
    context
        .expect_type_info()
        .times(1)
        .returning(|_| Ok(TypeInfo::property(Datatype::Double)));
    context
        .expect_operation_output_variables()
        .times(1)
        .returning(|_| Ok(sqrt_outputs()));

    let connection = open(&server, config, &context).await;

    assert_eq!(connection.state(), ConnectionState::Connected);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_endpoint_fails_init() {
    let server = EmbeddedServer::with_example_namespace();
    server.set_online(false);
    let mut connection =
        OpcUaAssetConnection::new(OpcUaAssetConnectionConfig::new(HOST)).unwrap();

    let result = connection
        .init(&CoreConfig::default(), &StaticServiceContext::new(), &server)
        .await;

    assert!(matches!(
        result,
        Err(InitError::Connection(AssetConnectionError::ConnectFailed { .. }))
    ));
    assert_eq!(connection.state(), ConnectionState::Uninitialized);
}

#[tokio::test]
async fn test_slow_endpoint_hits_connect_timeout() {
    let server = EmbeddedServer::with_example_namespace();
    server.set_response_delay(Duration::from_millis(500));
    let mut config = OpcUaAssetConnectionConfig::new(HOST);
    config.connect_timeout_ms = Some(50);
    let mut connection = OpcUaAssetConnection::new(config).unwrap();

    let result = connection
        .init(&CoreConfig::default(), &StaticServiceContext::new(), &server)
        .await;

    assert!(matches!(
        result,
        Err(InitError::Connection(AssetConnectionError::ConnectTimeout { .. }))
    ));
}

#[tokio::test]
async fn test_credentials_are_checked() {
    let server = EmbeddedServer::with_example_namespace().with_credentials("operator", "secret");

    let mut wrong = OpcUaAssetConnectionConfig::new(HOST);
    wrong.username = Some("operator".into());
    wrong.password = Some("guess".into());
    let mut connection = OpcUaAssetConnection::new(wrong).unwrap();
    let result = connection
        .init(&CoreConfig::default(), &StaticServiceContext::new(), &server)
        .await;
    assert!(
        matches!(result, Err(InitError::Connection(AssetConnectionError::ConnectFailed { ref reason, .. })) if reason.contains("BadUserAccessDenied"))
    );

    let mut right = OpcUaAssetConnectionConfig::new(HOST);
    right.username = Some("operator".into());
    right.password = Some("secret".into());
    let connection = open(&server, right, &StaticServiceContext::new()).await;
    assert_eq!(connection.state(), ConnectionState::Connected);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_slow_request_times_out() {
    let server = EmbeddedServer::with_example_namespace();
    let mut config = OpcUaAssetConnectionConfig::new(HOST);
    config.request_timeout_ms = Some(50);
    config
        .value_providers
        .insert(property("temp"), value_config("ScalarTypes/Double"));
    let context = StaticServiceContext::new()
        .with_type_info(property("temp"), TypeInfo::property(Datatype::Double));
    let connection = open(&server, config, &context).await;
    server.set_response_delay(Duration::from_millis(300));

    let err = assert_err!(connection.value_providers()[&property("temp")].get_value().await);

    assert!(matches!(err, AssetConnectionError::Timeout { .. }));
    server.set_response_delay(Duration::ZERO);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_lost_transport_fails_calls_until_it_recovers() {
    // Arrange
    let server = EmbeddedServer::with_example_namespace();
    let connection = open_values(
        &server,
        &[("temp", "ScalarTypes/Double", TypeInfo::property(Datatype::Double))],
    )
    .await;
    let provider = &connection.value_providers()[&property("temp")];

    // Act / Assert: down
    server.set_online(false);
    let err = assert_err!(provider.get_value().await);
    assert!(matches!(err, AssetConnectionError::Disconnected(_)));
    assert!(!connection.is_link_up());
    assert_eq!(connection.state(), ConnectionState::Connected);

    // Act / Assert: back up
    server.set_online(true);
    assert_ok!(provider.get_value().await);
    assert!(connection.is_link_up());
    connection.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_fails_in_flight_calls_fast() {
    // Arrange
    let server = EmbeddedServer::with_example_namespace();
    let mut config = OpcUaAssetConnectionConfig::new(HOST);
    config.request_timeout_ms = Some(10_000);
    config
        .value_providers
        .insert(property("temp"), value_config("ScalarTypes/Double"));
    let context = StaticServiceContext::new()
        .with_type_info(property("temp"), TypeInfo::property(Datatype::Double));
    let connection = Arc::new(open(&server, config, &context).await);
    let provider = Arc::clone(&connection.value_providers()[&property("temp")]);
    server.set_response_delay(Duration::from_secs(5));
    let started = Instant::now();
    let in_flight = tokio::spawn(async move { provider.get_value().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Act
    let (first, second) = tokio::join!(connection.close(), connection.close());
    let result = in_flight.await.unwrap();

    // Assert
    assert_ok!(first);
    assert_ok!(second);
    assert!(matches!(result, Err(AssetConnectionError::Closed)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(connection.state(), ConnectionState::Closed);
}
