//! Geospatial search scenarios: radius, bounds, k-NN, distance sorting.

use ferret::{
    Bounds, DistanceUnit, Document, Ferret, GeoFilters, GeoNear, GeoNearest, Point, SearchQuery,
    SortDirection,
};

fn store() -> Ferret {
    Ferret::in_memory().unwrap()
}

fn geo_doc(id: &str, title: &str, lat: f64, lng: f64) -> Document {
    Document::new(id).with_content("title", title).with_geo(lat, lng)
}

fn near(point: Point, radius: f64, units: DistanceUnit) -> GeoFilters {
    GeoFilters {
        near: Some(GeoNear { point, radius }),
        units,
        ..Default::default()
    }
}

#[test]
fn radius_filter_returns_only_nearby_results() {
    let ferret = store();
    ferret.create_index("shops").unwrap();
    ferret.index("shops", geo_doc("pdx", "coffee shop", 45.5152, -122.6734)).unwrap();
    ferret.index("shops", geo_doc("sea", "coffee shop", 47.6145, -122.3278)).unwrap();
    ferret.flush("shops").unwrap();

    let mut query = SearchQuery::text("coffee");
    query.geo_filters = Some(near(Point::new(45.5152, -122.6784), 5.0, DistanceUnit::Km));
    let results = ferret.search("shops", &query).unwrap();

    assert_eq!(results.results.len(), 1, "Seattle is outside the 5 km radius");
    assert_eq!(results.results[0].id, "pdx");
    let distance_km = results.results[0].distance.unwrap();
    assert!(distance_km <= 5.0, "distance {} exceeds the radius", distance_km);
}

#[test]
fn antimeridian_bounds_return_points_on_both_sides() {
    let ferret = store();
    ferret.create_index("islands").unwrap();
    ferret.index("islands", geo_doc("east", "island outpost", 0.0, 179.0)).unwrap();
    ferret.index("islands", geo_doc("west", "island outpost", 0.0, -179.0)).unwrap();
    ferret.index("islands", geo_doc("elsewhere", "island outpost", 0.0, 0.0)).unwrap();
    ferret.flush("islands").unwrap();

    let mut query = SearchQuery::text("island");
    query.geo_filters = Some(GeoFilters {
        within: Some(Bounds::new(10.0, -10.0, -170.0, 170.0)),
        ..Default::default()
    });
    let results = ferret.search("islands", &query).unwrap();

    let mut ids: Vec<&str> = results.results.iter().map(|r| r.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["east", "west"]);
}

#[test]
fn distance_sort_is_monotone_across_pages() {
    let ferret = store();
    ferret.create_index("spots").unwrap();
    // Spread along a meridian so distances differ cleanly
    for (i, lat) in [45.2, 45.9, 45.4, 46.3, 45.6, 46.0].iter().enumerate() {
        ferret.index("spots", geo_doc(&format!("s{}", i), "picnic spot", *lat, -122.0)).unwrap();
    }
    ferret.flush("spots").unwrap();

    let origin = Point::new(45.0, -122.0);
    let mut collected: Vec<f64> = Vec::new();
    for page in 0..3 {
        let mut query = SearchQuery::text("picnic");
        query.limit = 2;
        query.offset = page * 2;
        query.geo_filters = Some(GeoFilters {
            near: Some(GeoNear { point: origin, radius: 500.0 }),
            distance_sort: Some(SortDirection::Asc),
            units: DistanceUnit::Km,
            ..Default::default()
        });
        let results = ferret.search("spots", &query).unwrap();
        collected.extend(results.results.iter().map(|r| r.distance.unwrap()));
    }

    assert_eq!(collected.len(), 6);
    for pair in collected.windows(2) {
        assert!(pair[0] <= pair[1], "distances not monotone: {:?}", collected);
    }
}

#[test]
fn knn_returns_k_nearest_in_order() {
    let ferret = store();
    ferret.create_index("stations").unwrap();
    ferret.index("stations", geo_doc("a", "station", 45.1, -122.0)).unwrap();
    ferret.index("stations", geo_doc("b", "station", 45.3, -122.0)).unwrap();
    ferret.index("stations", geo_doc("c", "station", 45.7, -122.0)).unwrap();
    ferret.index("stations", geo_doc("d", "station", 47.0, -122.0)).unwrap();
    ferret.flush("stations").unwrap();

    let mut query = SearchQuery::default();
    query.geo_filters = Some(GeoFilters {
        nearest: Some(GeoNearest { point: Point::new(45.0, -122.0), k: 3, max_distance: None }),
        ..Default::default()
    });
    let results = ferret.search("stations", &query).unwrap();

    let ids: Vec<&str> = results.results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[test]
fn knn_respects_max_distance() {
    let ferret = store();
    ferret.create_index("stations").unwrap();
    ferret.index("stations", geo_doc("a", "station", 45.1, -122.0)).unwrap();
    ferret.index("stations", geo_doc("far", "station", 47.0, -122.0)).unwrap();
    ferret.flush("stations").unwrap();

    let mut query = SearchQuery::default();
    query.geo_filters = Some(GeoFilters {
        nearest: Some(GeoNearest {
            point: Point::new(45.0, -122.0),
            k: 5,
            max_distance: Some(50.0),
        }),
        units: DistanceUnit::Km,
        ..Default::default()
    });
    let results = ferret.search("stations", &query).unwrap();
    assert_eq!(results.results.len(), 1);
    assert_eq!(results.results[0].id, "a");
}

#[test]
fn geo_bounds_document_overrides_point() {
    let ferret = store();
    ferret.create_index("regions").unwrap();
    let mut doc = Document::new("box").with_content("title", "protected area");
    doc.geo = Some(Point::new(0.0, 0.0));
    doc.geo_bounds = Some(Bounds::new(50.0, 40.0, -100.0, -110.0));
    ferret.index("regions", doc).unwrap();
    ferret.flush("regions").unwrap();

    // The stored box intersects a query window around (45, -105), not (0, 0)
    let mut query = SearchQuery::text("protected");
    query.geo_filters = Some(GeoFilters {
        within: Some(Bounds::new(46.0, 44.0, -104.0, -106.0)),
        ..Default::default()
    });
    assert_eq!(ferret.search("regions", &query).unwrap().results.len(), 1);

    let mut query = SearchQuery::text("protected");
    query.geo_filters = Some(GeoFilters {
        within: Some(Bounds::new(1.0, -1.0, 1.0, -1.0)),
        ..Default::default()
    });
    assert!(ferret.search("regions", &query).unwrap().results.is_empty());
}

#[test]
fn distance_reported_in_requested_units() {
    let ferret = store();
    ferret.create_index("shops").unwrap();
    ferret.index("shops", geo_doc("pdx", "coffee", 45.5152, -122.6734)).unwrap();
    ferret.flush("shops").unwrap();

    let origin = Point::new(45.5152, -122.6784);
    let mut meters = SearchQuery::text("coffee");
    meters.geo_filters = Some(near(origin, 5_000.0, DistanceUnit::M));
    let mut miles = SearchQuery::text("coffee");
    miles.geo_filters = Some(near(origin, 3.1, DistanceUnit::Mi));

    let m = ferret.search("shops", &meters).unwrap().results[0].distance.unwrap();
    let mi = ferret.search("shops", &miles).unwrap().results[0].distance.unwrap();
    assert!((m / 1609.344 - mi).abs() < 1e-6, "meters {} vs miles {}", m, mi);
}

#[test]
fn bearing_and_cardinal_present_with_distance_context() {
    let ferret = store();
    ferret.create_index("peaks").unwrap();
    // Due north of the origin
    ferret.index("peaks", geo_doc("north", "summit", 46.0, -122.0)).unwrap();
    ferret.flush("peaks").unwrap();

    let mut query = SearchQuery::text("summit");
    query.geo_filters = Some(near(Point::new(45.0, -122.0), 200.0, DistanceUnit::Km));
    let hit = &ferret.search("peaks", &query).unwrap().results[0];
    let bearing = hit.bearing.unwrap();
    assert!(bearing < 1.0 || bearing > 359.0, "expected due north, got {}", bearing);
    assert_eq!(hit.bearing_cardinal.as_deref(), Some("N"));
}
