//! End-to-end scenarios driving the refactoring engine through full
//! schema+data transformations.

use flexibase_core::proto::{FilterExpr, Value};
use flexibase_core::{
    DataType, ObjectData, ObjectFilter, PropertyDef, PropertyMap, RefactoringEngine, SplitRule,
    StoreConfig, SurvivorPolicy, TargetClass,
};

fn engine() -> RefactoringEngine {
    RefactoringEngine::open(StoreConfig::temporary()).unwrap()
}

const COUNTRIES: [&str; 5] = ["NL", "DE", "FR", "BE", "UK"];

#[test]
fn extract_country_into_linked_class_dedupes_targets() {
    let engine = engine();
    let person = engine
        .create_class(
            "Person",
            vec![
                PropertyDef::text("Name", 60).required(),
                PropertyDef::text("Country", 30),
            ],
            None,
        )
        .unwrap();
    let name = person.get_property_by_name("Name").unwrap().id;
    let country = person.get_property_by_name("Country").unwrap().id;

    for i in 0..100 {
        engine
            .store()
            .insert_object(
                &person,
                &ObjectData::new()
                    .with(name, Value::Text(format!("P{}", i)))
                    .with(country, Value::Text(COUNTRIES[i % 5].into())),
            )
            .unwrap();
    }

    let report = engine
        .plain_properties_to_linked_object(
            person.id,
            &[country],
            PropertyDef::new("CountryRef", DataType::Link),
            &ObjectFilter::all(),
            TargetClass::New("Country".into()),
            false,
            Some(country),
            None,
        )
        .unwrap();

    assert_eq!(report.matched, 100);
    assert_eq!(report.created, 5);

    // Exactly one Country object per distinct value.
    let country_class = engine.registry().require_class_by_name("Country").unwrap();
    assert_eq!(engine.store().count_class(&country_class).unwrap(), 5);

    // The text property left the owner class; a link took its place.
    let person = engine.registry().require_class(person.id).unwrap();
    assert!(person.get_property_by_name("Country").is_none());
    let country_ref = person.get_property_by_name("CountryRef").unwrap();
    assert_eq!(country_ref.data_type, DataType::Link);
    assert_eq!(country_ref.referenced_class, Some(country_class.id));

    // Every person links to the country carrying its original value.
    let country_name = country_class.get_property_by_name("Country").unwrap().id;
    for (id, data) in engine.store().scan_class(&person).unwrap() {
        let linked = data
            .get(country_ref.id)
            .and_then(Value::as_ref_id)
            .unwrap_or_else(|| panic!("person {} lost its link", id));
        let target = engine
            .store()
            .read_object(&country_class, flexibase_core::ObjectId(linked))
            .unwrap()
            .unwrap();
        let expected = data.get(name).unwrap().as_str().unwrap();
        let suffix: usize = expected[1..].parse().unwrap();
        assert_eq!(
            target.get(country_name).unwrap().as_str(),
            Some(COUNTRIES[suffix % 5])
        );
    }
}

#[test]
fn filtered_extraction_leaves_unmatched_without_link() {
    let engine = engine();
    let person = engine
        .create_class(
            "Person",
            vec![
                PropertyDef::text("Name", 60),
                PropertyDef::text("Country", 30),
            ],
            None,
        )
        .unwrap();
    let name = person.get_property_by_name("Name").unwrap().id;
    let country = person.get_property_by_name("Country").unwrap().id;

    for (n, c) in [("a", "NL"), ("b", "DE")] {
        engine
            .store()
            .insert_object(
                &person,
                &ObjectData::new()
                    .with(name, Value::Text(n.into()))
                    .with(country, Value::Text(c.into())),
            )
            .unwrap();
    }

    let report = engine
        .plain_properties_to_linked_object(
            person.id,
            &[country],
            PropertyDef::new("CountryRef", DataType::Link),
            &ObjectFilter::matching(FilterExpr::eq("Country", Value::Text("NL".into()))),
            TargetClass::New("Country".into()),
            false,
            Some(country),
            None,
        )
        .unwrap();

    assert_eq!(report.matched, 1);
    assert_eq!(report.created, 1);

    let person = engine.registry().require_class(person.id).unwrap();
    let country_ref = person.get_property_by_name("CountryRef").unwrap().id;
    let mut with_link = 0;
    for (_, data) in engine.store().scan_class(&person).unwrap() {
        // The Country value is gone classwide, the link only where matched.
        assert!(data.get(country).is_none());
        if data.get(country_ref).is_some() {
            with_link += 1;
        }
    }
    assert_eq!(with_link, 1);
}

#[test]
fn merge_first_and_last_name_into_full_name() {
    let engine = engine();
    let person = engine
        .create_class(
            "Person",
            vec![
                PropertyDef::text("FirstName", 60),
                PropertyDef::text("LastName", 60),
                PropertyDef::new("Age", DataType::Integer),
            ],
            None,
        )
        .unwrap();
    let first = person.get_property_by_name("FirstName").unwrap().id;
    let last = person.get_property_by_name("LastName").unwrap().id;
    let age = person.get_property_by_name("Age").unwrap().id;

    let id = engine
        .store()
        .insert_object(
            &person,
            &ObjectData::new()
                .with(first, Value::Text("Ada".into()))
                .with(last, Value::Text("Lovelace".into()))
                .with(age, Value::Int(36)),
        )
        .unwrap();

    engine
        .merge_properties(
            person.id,
            &[first, last],
            PropertyDef::text("FullName", 120),
            "FirstName || ' ' || LastName",
        )
        .unwrap();

    let person = engine.registry().require_class(person.id).unwrap();
    assert!(person.get_property_by_name("FirstName").is_none());
    assert!(person.get_property_by_name("LastName").is_none());
    let full = person.get_property_by_name("FullName").unwrap().id;

    let data = engine.store().read_object(&person, id).unwrap().unwrap();
    assert_eq!(data.get(full).unwrap().as_str(), Some("Ada Lovelace"));
    // Untouched properties survive the reshape.
    assert_eq!(data.get(age).unwrap().as_i64(), Some(36));
}

#[test]
fn split_phone_into_area_code_and_number() {
    let engine = engine();
    let contact = engine
        .create_class("Contact", vec![PropertyDef::text("Phone", 30)], None)
        .unwrap();
    let phone = contact.get_property_by_name("Phone").unwrap().id;

    let id = engine
        .store()
        .insert_object(
            &contact,
            &ObjectData::new().with(phone, Value::Text("(020) 1234567".into())),
        )
        .unwrap();

    engine
        .split_property(
            contact.id,
            phone,
            &[
                SplitRule::new(PropertyDef::text("AreaCode", 6), r"^\((\d+)\)"),
                SplitRule::new(PropertyDef::text("Number", 20), r"\)\s*(\d+)$"),
            ],
        )
        .unwrap();

    let contact = engine.registry().require_class(contact.id).unwrap();
    assert!(contact.get_property_by_name("Phone").is_none());
    let area = contact.get_property_by_name("AreaCode").unwrap().id;
    let number = contact.get_property_by_name("Number").unwrap().id;

    let data = engine.store().read_object(&contact, id).unwrap().unwrap();
    assert_eq!(data.get(area).unwrap().as_str(), Some("020"));
    assert_eq!(data.get(number).unwrap().as_str(), Some("1234567"));
}

#[test]
fn nested_extraction_and_dissolution_round_trip() {
    let engine = engine();
    let person = engine
        .create_class(
            "Person",
            vec![
                PropertyDef::text("Name", 60),
                PropertyDef::text("Street", 120),
                PropertyDef::text("City", 60),
            ],
            None,
        )
        .unwrap();
    let name = person.get_property_by_name("Name").unwrap().id;
    let street = person.get_property_by_name("Street").unwrap().id;
    let city = person.get_property_by_name("City").unwrap().id;

    let id = engine
        .store()
        .insert_object(
            &person,
            &ObjectData::new()
                .with(name, Value::Text("Ada".into()))
                .with(street, Value::Text("1 Main St".into()))
                .with(city, Value::Text("London".into())),
        )
        .unwrap();

    engine
        .plain_properties_to_nested_object(
            person.id,
            &[street, city],
            PropertyDef::new("Address", DataType::Nested),
            &ObjectFilter::all(),
            TargetClass::New("Address".into()),
        )
        .unwrap();

    let person_v2 = engine.registry().require_class(person.id).unwrap();
    assert!(person_v2.get_property_by_name("Street").is_none());
    let address_ref = person_v2.get_property_by_name("Address").unwrap().id;

    let address_class = engine.registry().get_class_by_name("Address").unwrap();
    // Sub-objects are hidden rows: reachable through the owner only.
    assert_eq!(engine.store().count_class(&address_class).unwrap(), 0);

    let data = engine.store().read_object(&person_v2, id).unwrap().unwrap();
    let sub_id = data.get(address_ref).and_then(Value::as_ref_id).unwrap();
    let sub = engine
        .store()
        .read_object(&address_class, flexibase_core::ObjectId(sub_id))
        .unwrap()
        .unwrap();
    let sub_street = address_class.get_property_by_name("Street").unwrap().id;
    assert_eq!(sub.get(sub_street).unwrap().as_str(), Some("1 Main St"));

    // Now dissolve it back onto the owner.
    let sub_city = address_class.get_property_by_name("City").unwrap().id;
    engine
        .nested_object_to_plain_properties(
            person.id,
            address_ref,
            &ObjectFilter::all(),
            &PropertyMap::new().map_to_new(sub_street).map_to_new(sub_city),
        )
        .unwrap();

    let person_v3 = engine.registry().require_class(person.id).unwrap();
    assert!(person_v3.get_property_by_name("Address").is_none());
    let street_v3 = person_v3.get_property_by_name("Street").unwrap().id;
    let city_v3 = person_v3.get_property_by_name("City").unwrap().id;

    let data = engine.store().read_object(&person_v3, id).unwrap().unwrap();
    assert_eq!(data.get(street_v3).unwrap().as_str(), Some("1 Main St"));
    assert_eq!(data.get(city_v3).unwrap().as_str(), Some("London"));
    // The hidden row is gone for good.
    assert!(engine
        .store()
        .read_record(flexibase_core::ObjectId(sub_id))
        .unwrap()
        .is_none());
}

#[test]
fn dissolve_self_referencing_link() {
    let engine = engine();
    let person = engine
        .create_class(
            "Person",
            vec![
                PropertyDef::text("Name", 60),
                PropertyDef::text("ManagerName", 60),
            ],
            None,
        )
        .unwrap();
    let name = person.get_property_by_name("Name").unwrap().id;
    let manager_name = person.get_property_by_name("ManagerName").unwrap().id;

    // Add a link pointing back at the same class.
    let mut props = person.properties.clone();
    props.push(PropertyDef::link("Manager", person.id));
    let person = engine
        .alter_class(person.id, Some(props), None, None)
        .unwrap();
    let manager = person.get_property_by_name("Manager").unwrap().id;

    let alice = engine
        .store()
        .insert_object(
            &person,
            &ObjectData::new().with(name, Value::Text("Alice".into())),
        )
        .unwrap();
    let bob = engine
        .store()
        .insert_object(
            &person,
            &ObjectData::new()
                .with(name, Value::Text("Bob".into()))
                .with(manager, Value::ObjectRef(alice.0)),
        )
        .unwrap();

    // The link targets the class being operated on; dissolving it must
    // not conflict with the lock the operation itself holds.
    engine
        .linked_object_to_plain_props(
            person.id,
            manager,
            &ObjectFilter::all(),
            &PropertyMap::new().map(name, manager_name),
        )
        .unwrap();

    let person = engine.registry().require_class(person.id).unwrap();
    assert!(person.get_property_by_name("Manager").is_none());
    let data = engine.store().read_object(&person, bob).unwrap().unwrap();
    assert_eq!(data.get(manager_name).unwrap().as_str(), Some("Alice"));
    // The referenced object itself is left in place.
    assert!(engine.store().read_object(&person, alice).unwrap().is_some());
}

#[test]
fn structural_merge_skips_unmatched_sources() {
    let engine = engine();
    let customer = engine
        .create_class(
            "Customer",
            vec![
                PropertyDef::text("Email", 120),
                PropertyDef::text("Phone", 30),
            ],
            None,
        )
        .unwrap();
    let c_email = customer.get_property_by_name("Email").unwrap().id;
    let c_phone = customer.get_property_by_name("Phone").unwrap().id;

    let user = engine
        .create_class(
            "User",
            vec![
                PropertyDef::text("Email", 120),
                PropertyDef::text("Phone", 30),
            ],
            None,
        )
        .unwrap();
    let u_email = user.get_property_by_name("Email").unwrap().id;
    let u_phone = user.get_property_by_name("Phone").unwrap().id;

    let matched = engine
        .store()
        .insert_object(
            &customer,
            &ObjectData::new()
                .with(c_email, Value::Text("ada@example.org".into()))
                .with(c_phone, Value::Text("555-1234".into())),
        )
        .unwrap();
    let orphan = engine
        .store()
        .insert_object(
            &customer,
            &ObjectData::new().with(c_email, Value::Text("nobody@example.org".into())),
        )
        .unwrap();
    let target = engine
        .store()
        .insert_object(
            &user,
            &ObjectData::new().with(u_email, Value::Text("ada@example.org".into())),
        )
        .unwrap();

    let report = engine
        .structural_merge(
            customer.id,
            &ObjectFilter::all(),
            c_email,
            user.id,
            u_email,
            &PropertyMap::new().map(c_phone, u_phone),
        )
        .unwrap();

    assert_eq!(report.matched, 2);
    assert_eq!(report.deleted, 1);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].object, orphan);
    assert!(report.skipped[0].reason.contains("no match"));

    let data = engine.store().read_object(&user, target).unwrap().unwrap();
    assert_eq!(data.get(u_phone).unwrap().as_str(), Some("555-1234"));
    // Consumed source is gone, the skipped one survives.
    assert!(engine.store().read_object(&customer, matched).unwrap().is_none());
    assert!(engine.store().read_object(&customer, orphan).unwrap().is_some());
}

#[test]
fn structural_split_moves_properties_to_new_class() {
    let engine = engine();
    let order = engine
        .create_class(
            "Order",
            vec![
                PropertyDef::text("Number", 30),
                PropertyDef::text("ShipStreet", 120),
                PropertyDef::text("ShipCity", 60),
            ],
            None,
        )
        .unwrap();
    let number = order.get_property_by_name("Number").unwrap().id;
    let ship_street = order.get_property_by_name("ShipStreet").unwrap().id;
    let ship_city = order.get_property_by_name("ShipCity").unwrap().id;

    engine
        .store()
        .insert_object(
            &order,
            &ObjectData::new()
                .with(number, Value::Text("A-1".into()))
                .with(ship_street, Value::Text("1 Dock Rd".into()))
                .with(ship_city, Value::Text("Hull".into())),
        )
        .unwrap();

    let report = engine
        .structural_split(
            order.id,
            &ObjectFilter::all(),
            TargetClass::New("Shipment".into()),
            &PropertyMap::new().map_to_new(ship_street).map_to_new(ship_city),
        )
        .unwrap();
    assert_eq!(report.created, 1);

    let order = engine.registry().require_class(order.id).unwrap();
    assert!(order.get_property_by_name("ShipStreet").is_none());
    assert!(order.get_property_by_name("Number").is_some());

    let shipment = engine.registry().require_class_by_name("Shipment").unwrap();
    let rows = engine.store().scan_class(&shipment).unwrap();
    assert_eq!(rows.len(), 1);
    let s_street = shipment.get_property_by_name("ShipStreet").unwrap().id;
    assert_eq!(rows[0].1.get(s_street).unwrap().as_str(), Some("1 Dock Rd"));
}

#[test]
fn move_objects_between_classes() {
    let engine = engine();
    let person = engine
        .create_class("Person", vec![PropertyDef::text("Name", 60)], None)
        .unwrap();
    let p_name = person.get_property_by_name("Name").unwrap().id;
    let employee = engine
        .create_class("Employee", vec![PropertyDef::text("FullName", 60)], None)
        .unwrap();
    let e_name = employee.get_property_by_name("FullName").unwrap().id;

    let id = engine
        .store()
        .insert_object(&person, &ObjectData::new().with(p_name, Value::Text("Ada".into())))
        .unwrap();

    let report = engine
        .move_to_another_class(
            person.id,
            &ObjectFilter::by_id(id),
            employee.id,
            &PropertyMap::new().map(p_name, e_name),
        )
        .unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.row_deltas[0].class_after, Some(employee.id));

    assert!(engine.store().scan_class(&person).unwrap().is_empty());
    let rows = engine.store().scan_class(&employee).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1.get(e_name).unwrap().as_str(), Some("Ada"));
}

#[test]
fn deduplication_repoints_references_and_is_idempotent() {
    let engine = engine();
    let country = engine
        .create_class(
            "Country",
            vec![
                PropertyDef::text("Name", 30),
                PropertyDef::text("Capital", 60),
            ],
            None,
        )
        .unwrap();
    let c_name = country.get_property_by_name("Name").unwrap().id;
    let c_capital = country.get_property_by_name("Capital").unwrap().id;

    let person = engine
        .create_class(
            "Person",
            vec![PropertyDef::link("CountryRef", country.id)],
            None,
        )
        .unwrap();
    let p_ref = person.get_property_by_name("CountryRef").unwrap().id;

    let keeper = engine
        .store()
        .insert_object(&country, &ObjectData::new().with(c_name, Value::Text("NL".into())))
        .unwrap();
    let dup = engine
        .store()
        .insert_object(
            &country,
            &ObjectData::new()
                .with(c_name, Value::Text("NL".into()))
                .with(c_capital, Value::Text("Amsterdam".into())),
        )
        .unwrap();
    engine
        .store()
        .insert_object(&country, &ObjectData::new().with(c_name, Value::Text("DE".into())))
        .unwrap();

    let pointing = engine
        .store()
        .insert_object(
            &person,
            &ObjectData::new().with(p_ref, Value::ObjectRef(dup.0)),
        )
        .unwrap();

    let report = engine
        .remove_duplicated_objects(
            country.id,
            &ObjectFilter::all(),
            SurvivorPolicy::LowestId,
            &[c_name],
            true,
        )
        .unwrap();
    assert_eq!(report.deleted, 1);

    // The duplicate is gone, the reference follows the survivor and the
    // survivor picked up the value it was missing.
    assert!(engine.store().read_object(&country, dup).unwrap().is_none());
    let data = engine.store().read_object(&person, pointing).unwrap().unwrap();
    assert_eq!(data.get(p_ref), Some(&Value::ObjectRef(keeper.0)));
    let kept = engine.store().read_object(&country, keeper).unwrap().unwrap();
    assert_eq!(kept.get(c_capital).unwrap().as_str(), Some("Amsterdam"));
    assert_eq!(engine.store().count_class(&country).unwrap(), 2);

    // A second run finds nothing left to collapse.
    let report = engine
        .remove_duplicated_objects(
            country.id,
            &ObjectFilter::all(),
            SurvivorPolicy::LowestId,
            &[c_name],
            true,
        )
        .unwrap();
    assert_eq!(report.deleted, 0);
    assert_eq!(report.updated, 0);
}

#[test]
fn default_survivor_policy_prefers_recently_updated_duplicate() {
    let engine = engine();
    let country = engine
        .create_class(
            "Country",
            vec![
                PropertyDef::text("Name", 30),
                PropertyDef::text("Capital", 60),
            ],
            None,
        )
        .unwrap();
    let c_name = country.get_property_by_name("Name").unwrap().id;
    let c_capital = country.get_property_by_name("Capital").unwrap().id;

    let older = engine
        .store()
        .insert_object(&country, &ObjectData::new().with(c_name, Value::Text("NL".into())))
        .unwrap();
    let newer = engine
        .store()
        .insert_object(&country, &ObjectData::new().with(c_name, Value::Text("NL".into())))
        .unwrap();

    // Touch the first-inserted duplicate last; neither has incoming
    // references, so the tie falls to the most recent write.
    std::thread::sleep(std::time::Duration::from_millis(2));
    engine
        .store()
        .update_object(
            &country,
            older,
            &ObjectData::new()
                .with(c_name, Value::Text("NL".into()))
                .with(c_capital, Value::Text("Amsterdam".into())),
        )
        .unwrap();

    let report = engine
        .remove_duplicated_objects(
            country.id,
            &ObjectFilter::all(),
            SurvivorPolicy::default(),
            &[c_name],
            false,
        )
        .unwrap();
    assert_eq!(report.deleted, 1);

    assert!(engine.store().read_object(&country, newer).unwrap().is_none());
    let kept = engine.store().read_object(&country, older).unwrap().unwrap();
    assert_eq!(kept.get(c_capital).unwrap().as_str(), Some("Amsterdam"));
}

#[test]
fn undo_alter_restores_schema_and_rows() {
    let engine = engine();
    let person = engine
        .create_class(
            "Person",
            vec![
                PropertyDef::text("Name", 60),
                PropertyDef::new("Age", DataType::Integer),
            ],
            None,
        )
        .unwrap();
    let name = person.get_property_by_name("Name").unwrap().id;
    let age = person.get_property_by_name("Age").unwrap().id;

    let id = engine
        .store()
        .insert_object(
            &person,
            &ObjectData::new()
                .with(name, Value::Text("Ada".into()))
                .with(age, Value::Int(36)),
        )
        .unwrap();

    let kept: Vec<PropertyDef> = person
        .properties
        .iter()
        .filter(|p| p.id != age)
        .cloned()
        .collect();
    engine.alter_class(person.id, Some(kept), None, None).unwrap();
    assert_eq!(engine.registry().require_class(person.id).unwrap().version, 2);

    engine.undo_last_action().unwrap();

    let restored = engine.registry().require_class(person.id).unwrap();
    assert_eq!(restored.version, 1);
    assert!(restored.get_property_by_name("Age").is_some());
    let data = engine.store().read_object(&restored, id).unwrap().unwrap();
    assert_eq!(data.get(age).unwrap().as_i64(), Some(36));

    // An undo cannot itself be undone.
    assert!(engine.undo_last_action().is_err());
}

#[test]
fn undo_linked_extraction_removes_created_class() {
    let engine = engine();
    let person = engine
        .create_class("Person", vec![PropertyDef::text("Country", 30)], None)
        .unwrap();
    let country = person.get_property_by_name("Country").unwrap().id;

    let id = engine
        .store()
        .insert_object(
            &person,
            &ObjectData::new().with(country, Value::Text("NL".into())),
        )
        .unwrap();

    engine
        .plain_properties_to_linked_object(
            person.id,
            &[country],
            PropertyDef::new("CountryRef", DataType::Link),
            &ObjectFilter::all(),
            TargetClass::New("Country".into()),
            false,
            Some(country),
            None,
        )
        .unwrap();
    assert!(engine.registry().get_class_by_name("Country").is_some());

    engine.undo_last_action().unwrap();

    assert!(engine.registry().get_class_by_name("Country").is_none());
    let restored = engine.registry().require_class(person.id).unwrap();
    assert_eq!(restored.version, 1);
    let data = engine.store().read_object(&restored, id).unwrap().unwrap();
    assert_eq!(data.get(country).unwrap().as_str(), Some("NL"));
}

#[test]
fn undo_drop_class_restores_objects() {
    let engine = engine();
    let person = engine
        .create_class("Person", vec![PropertyDef::text("Name", 60)], None)
        .unwrap();
    let name = person.get_property_by_name("Name").unwrap().id;

    let id = engine
        .store()
        .insert_object(&person, &ObjectData::new().with(name, Value::Text("Ada".into())))
        .unwrap();

    engine.drop_class(person.id).unwrap();
    assert!(engine.registry().get_class_by_name("Person").is_none());

    engine.undo_last_action().unwrap();

    let restored = engine.registry().get_class_by_name("Person").unwrap();
    let data = engine.store().read_object(&restored, id).unwrap().unwrap();
    assert_eq!(data.get(name).unwrap().as_str(), Some("Ada"));
}

#[test]
fn report_json_round_trips() {
    let engine = engine();
    engine
        .create_class("Person", vec![PropertyDef::text("Name", 60)], None)
        .unwrap();

    let report = engine.last_action_report().unwrap();
    let json = report.to_json().unwrap();
    assert!(json.contains("\"operation\": \"create_class\""));
}
