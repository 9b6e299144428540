use super::*;
use crate::error::FaultCategory;
use crate::permissions::{AccessContext, AccessLevel, AccessOptions, Org, Principal};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn org() -> Arc<Org> {
    Arc::new(Org {
        id: "org-1".to_string(),
        code: "test".to_string(),
        configuration: Default::default(),
    })
}

fn context(grant: AccessLevel) -> AccessContext {
    let principal = Arc::new(Principal::new("principal-1", org()));
    AccessContext::new(
        principal,
        "c_widget",
        &AccessOptions {
            grant: Some(grant),
            ..Default::default()
        },
    )
}

fn segments_definition() -> PropertyDefinition {
    let mut caption = PropertyDefinition::new("caption", NodeType::String);
    caption.default = Some(json!("untitled"));
    let mut set = PropertyDefinition::new("c_segments", NodeType::Set);
    set.documents = vec![
        DocumentDefinition {
            name: "a".to_string(),
            min_required: 1,
            max_allowed: None,
            properties: vec![caption],
        },
        DocumentDefinition {
            name: "b".to_string(),
            min_required: 0,
            max_allowed: Some(2),
            properties: vec![PropertyDefinition::new("weight", NodeType::Number)],
        },
    ];
    set
}

fn widget_definition() -> ModelDefinition {
    let mut title = PropertyDefinition::new("c_title", NodeType::String);
    title.overridable = true;
    let mut locked = PropertyDefinition::new("c_locked", NodeType::String);
    locked.writable = false;
    ModelDefinition {
        name: "c_widget".to_string(),
        label: None,
        unmanaged: false,
        deletable: true,
        obey_object_mode: false,
        has_feeds: false,
        migrating: false,
        default_acl: Vec::new(),
        create_acl: Vec::new(),
        properties: vec![title, locked, segments_definition()],
        types: Some(vec![
            TypeDefinition {
                id: Some("type-x".to_string()),
                name: "x".to_string(),
                properties: vec![
                    PropertyDefinition::new("c_title", NodeType::String),
                    PropertyDefinition::new("c_x_only", NodeType::Number),
                ],
            },
            TypeDefinition {
                id: None,
                name: "y".to_string(),
                properties: vec![PropertyDefinition::new("c_y_only", NodeType::Boolean)],
            },
        ]),
    }
}

fn widget() -> TypedModel {
    ModelCompiler::new(widget_definition())
        .compile()
        .expect("widget compiles")
}

#[test]
fn base_properties_resolve_identically_through_every_variant() {
    let model = widget();
    let base_paths = ["_id", "c_locked", "c_segments", "c_segments.weight", "created"];
    for path in base_paths {
        let base = model.find_node(path).expect(path);
        for variant in model.variants() {
            let through_variant = model
                .find_node_in(ModelVariant::Typed(variant), path)
                .expect(path);
            assert_eq!(base, through_variant, "{} via {}", path, variant.name);
        }
    }
}

#[test]
fn overrides_replace_the_master_only_in_their_variant() {
    let model = widget();
    let x = model.variant_named("x").expect("x");
    let base = model.find_node("c_title").expect("base title");
    let overridden = model
        .find_node_in(ModelVariant::Typed(x), "c_title")
        .expect("x title");
    assert_ne!(base, overridden);
    assert_eq!(model.node(overridden).master, Some(base));
    assert!(model.node(overridden).is_equivalent_to(model.node(base)));
    assert_eq!(model.node(overridden).fqpp, "c_widget#x.c_title");

    let y = model.variant_named("y").expect("y");
    assert_eq!(model.find_node_in(ModelVariant::Typed(y), "c_title"), Some(base));
    assert!(model.find_node_in(ModelVariant::Typed(y), "c_x_only").is_none());
    assert_eq!(model.find_node_across_variants("c_title"), vec![base, overridden]);
}

#[test]
fn variant_lookup_by_id_or_name() {
    let model = widget();
    assert_eq!(model.variant_named("type-x").map(|v| v.name.as_str()), Some("x"));
    assert!(matches!(model.resolve_variant(Some("nope")), ModelVariant::Base));
    assert!(matches!(model.resolve_variant(None), ModelVariant::Base));
}

#[test]
fn overriding_a_fixed_property_is_rejected() {
    let mut definition = widget_definition();
    if let Some(types) = definition.types.as_mut() {
        types[1]
            .properties
            .push(PropertyDefinition::new("c_locked", NodeType::String));
    }
    let fault = ModelCompiler::new(definition).compile().unwrap_err();
    assert!(fault.is(FaultCategory::InvalidArgument, "schemaDefinition"));
}

#[test]
fn overrides_must_stay_equivalent() {
    let mut definition = widget_definition();
    if let Some(types) = definition.types.as_mut() {
        types[0].properties[0] = PropertyDefinition::new("c_title", NodeType::Number);
    }
    let fault = ModelCompiler::new(definition).compile().unwrap_err();
    assert_eq!(fault.code(), "invalidArgument.schemaDefinition");
}

#[test]
fn property_names_are_checked() {
    let mut definition = widget_definition();
    definition
        .properties
        .push(PropertyDefinition::new("9lives", NodeType::String));
    assert!(ModelCompiler::new(definition).compile().is_err());

    let mut definition = widget_definition();
    definition
        .properties
        .push(PropertyDefinition::new("owner", NodeType::String));
    let fault = ModelCompiler::new(definition).compile().unwrap_err();
    assert!(fault.to_string().contains("built-in"));
}

#[test]
fn unmanaged_models_skip_ownership_fields() {
    let mut definition = widget_definition();
    definition.unmanaged = true;
    definition.types = None;
    let model = ModelCompiler::new(definition).compile().expect("compiles");
    for path in ["creator", "owner", "acl", "sequence", "updated", "type"] {
        assert!(model.find_node(path).is_none(), "{}", path);
    }
    for path in ["_id", "object", "org", "created", "reap"] {
        assert!(model.find_node(path).is_some(), "{}", path);
    }
}

#[test]
fn set_documents_get_forced_id_and_discriminator() {
    let model = widget();
    let set = model.find_node("c_segments").expect("set");
    let node = model.node(set);
    assert!(node.array);
    let documents = node.set().expect("set children").documents();
    for document in documents {
        let id = model.child(document.node, "_id").expect("_id");
        let discriminator = model.child(document.node, "name").expect("name");
        assert!(!model.node(discriminator).writable);
        assert!(model.node(discriminator).creatable);
        assert_eq!(model.node(id).fullpath, "c_segments._id");
    }
    assert_eq!(model.node(documents[0].node).fqpp, "c_widget.c_segments#a");
    assert_eq!(model.find_nodes("c_segments.name").len(), 2);
}

#[test]
fn attachments_require_a_matching_path() {
    struct Upper;
    impl PropertyWriter for Upper {
        fn write(&self, _ac: &AccessContext, _node: &SchemaNode, value: Value) -> crate::FaultResult<Value> {
            Ok(value.as_str().map(|s| json!(s.to_uppercase())).unwrap_or(value))
        }
    }
    let fault = ModelCompiler::new(widget_definition())
        .writer("c_missing", Arc::new(Upper))
        .compile()
        .unwrap_err();
    assert_eq!(fault.code(), "notFound.property");

    let model = ModelCompiler::new(widget_definition())
        .writer("c_title", Arc::new(Upper))
        .compile()
        .expect("compiles");
    for id in model.find_nodes("c_title") {
        assert!(model.node(id).capabilities.writer.is_some());
    }
}

#[test]
fn type_guard() {
    let model = widget();
    let selection = model
        .select_variant_for_write(&json!({}), &json!({ "type": "x" }), true)
        .expect("new document may be typed");
    assert_eq!(selection.variant.type_name(), Some("x"));

    let fault = model
        .select_variant_for_write(&json!({}), &json!({ "c_title": "t" }), true)
        .unwrap_err();
    assert_eq!(fault.code(), "invalidArgument.nullInstanceType");

    let fault = model
        .select_variant_for_write(&json!({}), &json!({ "type": "z" }), true)
        .unwrap_err();
    assert_eq!(fault.code(), "invalidArgument.instanceTypeMismatch");

    let stored = json!({ "type": "x" });
    for payload in [json!({ "type": "y" }), json!({ "type": "x" }), json!({ "type": null })] {
        let fault = model
            .select_variant_for_write(&stored, &payload, false)
            .unwrap_err();
        assert_eq!(fault.code(), "invalidArgument.instanceRetyping");
    }

    let selection = model
        .select_variant_for_write(&json!({ "type": null }), &json!({ "type": "y" }), false)
        .expect("null type may be set");
    assert!(selection.retyped_from_null);
    let marked = model.variant_property_paths(selection.variant);
    for path in ["c_y_only", "c_title", "c_locked", "c_segments", "c_segments.weight", "type"] {
        assert!(marked.iter().any(|p| p == path), "{} not marked", path);
    }
    assert!(!marked.iter().any(|p| p == "c_x_only" || p.is_empty()));
}

#[test]
fn set_min_required_counts_missing_discriminators() {
    let model = widget();
    let ac = context(AccessLevel::Update);
    let writer = DocumentWriter::new(&model, ModelVariant::Base);

    let mut document = json!({});
    let mut ctx = WriteContext::create();
    writer
        .write(&ac, &mut document, &json!({ "c_segments": [{ "name": "b" }] }), &mut ctx)
        .expect("write");
    let fault = validate_document(&model, ModelVariant::Base, &ac, &document, ValidationScope::All)
        .unwrap_err();
    assert_eq!(fault.code(), "invalidArgument.minRequired");
    assert_eq!(fault.reason.as_deref(), Some("segment: a"));

    let mut document = json!({});
    let mut ctx = WriteContext::create();
    writer
        .write(
            &ac,
            &mut document,
            &json!({ "c_segments": [{ "name": "a" }, { "name": "b", "weight": 2 }] }),
            &mut ctx,
        )
        .expect("write");
    validate_document(&model, ModelVariant::Base, &ac, &document, ValidationScope::All)
        .expect("valid");
    let elements = document["c_segments"].as_array().expect("array");
    assert_eq!(elements[0]["caption"], json!("untitled"));
    assert_eq!(elements[1]["weight"], json!(2));
    assert!(elements.iter().all(|e| e["_id"].is_string()));
    assert!(ctx.is_modified("c_segments"));
}

#[test]
fn unknown_discriminators_are_rejected() {
    let model = widget();
    let ac = context(AccessLevel::Update);
    let writer = DocumentWriter::new(&model, ModelVariant::Base);
    let mut document = json!({});
    let fault = writer
        .write(
            &ac,
            &mut document,
            &json!({ "c_segments": [{ "name": "a" }, { "name": "zzz" }] }),
            &mut WriteContext::create(),
        )
        .unwrap_err();
    assert_eq!(fault.category, FaultCategory::NotFound);

    let fault = writer
        .write(
            &ac,
            &mut json!({}),
            &json!({ "c_segments": [{ "weight": 1 }] }),
            &mut WriteContext::create(),
        )
        .unwrap_err();
    assert_eq!(fault.code(), "invalidArgument.unspecified");
}

#[test]
fn set_elements_merge_by_id_and_shift_when_bounded() {
    let mut definition = widget_definition();
    definition.types = None;
    definition.properties[0].overridable = false;
    let set = &mut definition.properties[2];
    set.max_items = Some(2);
    set.max_shift = true;
    let model = ModelCompiler::new(definition).compile().expect("compiles");
    let ac = context(AccessLevel::Update);
    let writer = DocumentWriter::new(&model, ModelVariant::Base);

    let mut document = json!({});
    for weight in 1..=3 {
        writer
            .write(
                &ac,
                &mut document,
                &json!({ "c_segments": [{ "name": "b", "weight": weight }] }),
                &mut WriteContext::update(WriteMethod::Put),
            )
            .expect("write");
    }
    let weights: Vec<Value> = document["c_segments"]
        .as_array()
        .expect("array")
        .iter()
        .map(|e| e["weight"].clone())
        .collect();
    assert_eq!(weights, vec![json!(2), json!(3)]);

    let id = document["c_segments"][0]["_id"].clone();
    writer
        .write(
            &ac,
            &mut document,
            &json!({ "c_segments": [{ "_id": id, "weight": 20 }] }),
            &mut WriteContext::update(WriteMethod::Put),
        )
        .expect("merge");
    assert_eq!(document["c_segments"].as_array().map(Vec::len), Some(2));
    assert_eq!(document["c_segments"][0]["weight"], json!(20));

    let fault = writer
        .write(
            &ac,
            &mut document,
            &json!({ "c_segments": [{ "_id": id, "name": "a" }] }),
            &mut WriteContext::update(WriteMethod::Put),
        )
        .unwrap_err();
    assert_eq!(fault.code(), "accessDenied.propertyUpdate");
}

#[test]
fn failed_element_writes_do_not_shift_the_set() {
    let mut definition = widget_definition();
    definition.types = None;
    definition.properties[0].overridable = false;
    let set = &mut definition.properties[2];
    set.max_items = Some(2);
    set.max_shift = true;
    let model = ModelCompiler::new(definition).compile().expect("compiles");
    let ac = context(AccessLevel::Update);
    let writer = DocumentWriter::new(&model, ModelVariant::Base);

    let mut document = json!({});
    writer
        .write(
            &ac,
            &mut document,
            &json!({ "c_segments": [{ "name": "b", "weight": 1 }, { "name": "b", "weight": 2 }] }),
            &mut WriteContext::update(WriteMethod::Put),
        )
        .expect("write");
    let before = document["c_segments"].clone();

    let fault = writer
        .write(
            &ac,
            &mut document,
            &json!({ "c_segments": [{ "name": "b", "weight": "heavy" }] }),
            &mut WriteContext::update(WriteMethod::Put),
        )
        .unwrap_err();
    assert_eq!(fault.category, FaultCategory::InvalidArgument);
    assert_eq!(document["c_segments"], before);
}

fn links_model() -> TypedModel {
    let link = |name: &str| DocumentDefinition {
        name: name.to_string(),
        min_required: 0,
        max_allowed: None,
        properties: vec![
            PropertyDefinition::new("label", NodeType::String),
            PropertyDefinition::new("target", NodeType::String),
        ],
    };
    let mut links = PropertyDefinition::new("c_links", NodeType::Set);
    links.unique_key = Some("label".to_string());
    links.unique_prop = Some("target".to_string());
    links.documents = vec![link("web"), link("mail")];

    let mut definition = widget_definition();
    definition.types = None;
    definition.properties[0].overridable = false;
    definition.properties.push(links);
    ModelCompiler::new(definition).compile().expect("compiles")
}

#[test]
fn unique_keys_locate_existing_elements() {
    let model = links_model();
    let ac = context(AccessLevel::Update);
    let writer = DocumentWriter::new(&model, ModelVariant::Base);

    let mut document = json!({});
    writer
        .write(
            &ac,
            &mut document,
            &json!({ "c_links": [{ "name": "web", "label": "home", "target": "a" }] }),
            &mut WriteContext::update(WriteMethod::Put),
        )
        .expect("write");
    let id = document["c_links"][0]["_id"].clone();

    writer
        .write(
            &ac,
            &mut document,
            &json!({ "c_links": [{ "label": "home", "target": "b" }] }),
            &mut WriteContext::update(WriteMethod::Put),
        )
        .expect("merge by label");
    let links = document["c_links"].as_array().expect("array");
    assert_eq!(links.len(), 1);
    assert_eq!(links[0]["_id"], id);
    assert_eq!(links[0]["name"], json!("web"));
    assert_eq!(links[0]["target"], json!("b"));
}

#[test]
fn unique_props_conflict_across_elements() {
    let model = links_model();
    let ac = context(AccessLevel::Update);
    let writer = DocumentWriter::new(&model, ModelVariant::Base);

    let mut document = json!({});
    writer
        .write(
            &ac,
            &mut document,
            &json!({ "c_links": [
                { "name": "web", "label": "home", "target": "x" },
                { "name": "mail", "label": "office", "target": "x" },
            ] }),
            &mut WriteContext::update(WriteMethod::Put),
        )
        .expect("write");
    assert_eq!(document["c_links"].as_array().map(Vec::len), Some(2));

    let fault = validate_document(&model, ModelVariant::Base, &ac, &document, ValidationScope::All)
        .unwrap_err();
    assert_eq!(fault.code(), "conflict.uniqueInArray");
    assert_eq!(fault.path.as_deref(), Some("c_links.target"));
}

#[test]
fn set_max_allowed_limits_one_discriminator() {
    let model = widget();
    let ac = context(AccessLevel::Update);
    let writer = DocumentWriter::new(&model, ModelVariant::Base);

    let mut document = json!({});
    writer
        .write(
            &ac,
            &mut document,
            &json!({ "c_segments": [
                { "name": "a" },
                { "name": "b", "weight": 1 },
                { "name": "b", "weight": 2 },
                { "name": "b", "weight": 3 },
            ] }),
            &mut WriteContext::create(),
        )
        .expect("write");
    let fault = validate_document(&model, ModelVariant::Base, &ac, &document, ValidationScope::All)
        .unwrap_err();
    assert_eq!(fault.code(), "invalidArgument.maxAllowed");
    assert_eq!(fault.reason.as_deref(), Some("segment: b"));
}

#[test]
fn removing_a_set_element_runs_its_variant_hook() {
    struct Count(AtomicUsize);
    impl RemovalHook for Count {
        fn on_removing_value(&self, _ac: &AccessContext, _element: &Value) -> crate::FaultResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
    let hook = Arc::new(Count(AtomicUsize::new(0)));
    let model = ModelCompiler::new(widget_definition())
        .removal_hook("c_segments", "a", hook.clone())
        .compile()
        .expect("compiles");
    let ac = context(AccessLevel::Update);
    let writer = DocumentWriter::new(&model, ModelVariant::Base);
    let mut document = json!({});
    writer
        .write(
            &ac,
            &mut document,
            &json!({ "c_segments": [{ "name": "a" }, { "name": "b" }] }),
            &mut WriteContext::create(),
        )
        .expect("write");

    let b_id = document["c_segments"][1]["_id"].as_str().expect("id").to_string();
    let a_id = document["c_segments"][0]["_id"].as_str().expect("id").to_string();
    let mut ctx = WriteContext::update(WriteMethod::Put);
    writer
        .remove(&ac, &mut document, &format!("c_segments.{}", b_id), &mut ctx)
        .expect("remove b");
    assert_eq!(hook.0.load(Ordering::SeqCst), 0);
    writer
        .remove(&ac, &mut document, &format!("c_segments.{}", a_id), &mut ctx)
        .expect("remove a");
    assert_eq!(hook.0.load(Ordering::SeqCst), 1);
    assert_eq!(document["c_segments"], json!([]));
}

#[test]
fn writes_respect_property_flags() {
    let model = widget();
    let writer = DocumentWriter::new(&model, ModelVariant::Base);
    let fault = writer
        .write(
            &context(AccessLevel::Update),
            &mut json!({}),
            &json!({ "c_locked": "no" }),
            &mut WriteContext::update(WriteMethod::Put),
        )
        .unwrap_err();
    assert_eq!(fault.code(), "accessDenied.propertyUpdate");

    let fault = writer
        .write(
            &context(AccessLevel::Read),
            &mut json!({}),
            &json!({ "c_title": "t" }),
            &mut WriteContext::update(WriteMethod::Put),
        )
        .unwrap_err();
    assert_eq!(fault.code(), "accessDenied.propertyUpdate");

    let fault = writer
        .write(
            &context(AccessLevel::Update),
            &mut json!({}),
            &json!({ "c_nope": 1 }),
            &mut WriteContext::update(WriteMethod::Put),
        )
        .unwrap_err();
    assert_eq!(fault.code(), "notFound.property");
    assert_eq!(fault.path.as_deref(), Some("c_nope"));
}

#[test]
fn reads_omit_hidden_properties() {
    let model = widget();
    let document = json!({ "_id": "d1", "org": "org-1", "c_title": "t", "reap": false });
    let read = reader::read_document(
        &model,
        &context(AccessLevel::Read),
        &document,
        &crate::reporting::NoopMetrics,
    )
    .expect("read");
    assert_eq!(read, json!({ "_id": "d1", "c_title": "t" }));
}

#[test]
fn registry_replaces_models_wholesale() {
    let registry = SchemaRegistry::new();
    assert_eq!(registry.get("c_widget").unwrap_err().code(), "notFound.model");
    let first = registry.define(widget()).expect("define");
    let mut definition = widget_definition();
    definition.types = None;
    definition.properties[0].overridable = false;
    registry
        .define(ModelCompiler::new(definition).compile().expect("compiles"))
        .expect("redefine");
    assert!(first.is_typed());
    assert!(!registry.get("c_widget").expect("get").is_typed());
    assert_eq!(registry.object_names(), vec!["c_widget".to_string()]);
}
