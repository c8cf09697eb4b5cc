//! Footprint geometry: GeoJSON or WKT files to the WKT the catalog expects.

use std::fmt;
use std::path::Path;

use serde_json::Value;

use crate::error::{Error, Result};

/// `(x, y)`, i.e. `(longitude, latitude)`.
pub type Position = (f64, f64);
pub type Ring = Vec<Position>;
pub type Polygon = Vec<Ring>;

/// A polygonal search area.
#[derive(Debug, Clone, PartialEq)]
pub enum Footprint {
    Polygon(Polygon),
    MultiPolygon(Vec<Polygon>),
}

impl Footprint {
    /// Parses `POLYGON` / `MULTIPOLYGON` WKT. An EWKT `SRID=...;` prefix and a
    /// `Z` dimension are accepted; the third coordinate is dropped.
    pub fn parse_wkt(wkt: &str) -> Result<Self> {
        parse_wkt(wkt).map_err(|reason| Error::InvalidQuery(format!("footprint is not valid WKT: {reason}")))
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let polygons: Vec<&Polygon> = match self {
            Self::Polygon(p) => vec![p],
            Self::MultiPolygon(ps) => ps.iter().collect(),
        };
        if polygons.is_empty() {
            return Err("multipolygon has no polygons".into());
        }
        for polygon in polygons {
            if polygon.is_empty() {
                return Err("polygon has no rings".into());
            }
            for ring in polygon {
                if ring.len() < 4 {
                    return Err(format!("ring has {} position(s), at least 4 are required", ring.len()));
                }
                if ring.first() != ring.last() {
                    return Err("ring is not closed".into());
                }
                if ring.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
                    return Err("ring contains a non-finite coordinate".into());
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Footprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Polygon(p) => {
                write!(f, "POLYGON")?;
                write_polygon(f, p)
            }
            Self::MultiPolygon(ps) => {
                write!(f, "MULTIPOLYGON(")?;
                for (i, p) in ps.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write_polygon(f, p)?;
                }
                write!(f, ")")
            }
        }
    }
}

fn write_polygon(f: &mut fmt::Formatter<'_>, polygon: &Polygon) -> fmt::Result {
    write!(f, "(")?;
    for (i, ring) in polygon.iter().enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        write!(f, "(")?;
        for (j, (x, y)) in ring.iter().enumerate() {
            if j > 0 {
                write!(f, ",")?;
            }
            write!(f, "{x} {y}")?;
        }
        write!(f, ")")?;
    }
    write!(f, ")")
}

/// Reads a geometry file and returns its footprint as normalized WKT.
///
/// GeoJSON (`Polygon`, `MultiPolygon`, a `Feature` or a single-feature
/// `FeatureCollection`) and plain WKT files are accepted.
pub fn to_wkt(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let format_error = |reason: String| Error::GeometryFormat {
        path: path.to_path_buf(),
        reason,
    };

    let text = std::fs::read_to_string(path).map_err(|e| format_error(format!("cannot read file: {e}")))?;
    let text = text.trim_start_matches('\u{feff}').trim();
    if text.is_empty() {
        return Err(format_error("file is empty".into()));
    }

    let footprint = if text.starts_with('{') {
        let value: Value =
            serde_json::from_str(text).map_err(|e| format_error(format!("malformed GeoJSON: {e}")))?;
        from_geojson(&value).map_err(format_error)?
    } else {
        parse_wkt(text).map_err(format_error)?
    };

    tracing::debug!(path = %path.display(), "converted geometry to WKT");
    Ok(footprint.to_string())
}

/// Checks that `wkt` is a well-formed `POLYGON` or `MULTIPOLYGON`.
pub fn validate_wkt(wkt: &str) -> Result<()> {
    Footprint::parse_wkt(wkt).map(|_| ())
}

fn from_geojson(value: &Value) -> std::result::Result<Footprint, String> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or("GeoJSON object has no \"type\"")?;

    let footprint = match kind {
        "FeatureCollection" => {
            let features = value
                .get("features")
                .and_then(Value::as_array)
                .ok_or("feature collection has no \"features\" array")?;
            match features.as_slice() {
                [] => return Err("feature collection is empty".into()),
                [feature] => return from_geojson(feature),
                many => {
                    return Err(format!(
                        "feature collection has {} features, exactly one polygon or multipolygon is required",
                        many.len()
                    ));
                }
            }
        }
        "Feature" => match value.get("geometry") {
            Some(geometry) if !geometry.is_null() => return from_geojson(geometry),
            _ => return Err("feature has no geometry".into()),
        },
        "Polygon" => {
            let coords: Vec<Vec<Vec<f64>>> = coordinates(value)?;
            Footprint::Polygon(polygon_from(coords)?)
        }
        "MultiPolygon" => {
            let coords: Vec<Vec<Vec<Vec<f64>>>> = coordinates(value)?;
            Footprint::MultiPolygon(
                coords
                    .into_iter()
                    .map(polygon_from)
                    .collect::<std::result::Result<_, _>>()?,
            )
        }
        other => {
            return Err(format!(
                "unsupported geometry type {other}, a Polygon or MultiPolygon is required"
            ));
        }
    };

    footprint.validate()?;
    Ok(footprint)
}

fn coordinates<T: serde::de::DeserializeOwned>(value: &Value) -> std::result::Result<T, String> {
    let coords = value.get("coordinates").ok_or("geometry has no \"coordinates\"")?;
    serde_json::from_value(coords.clone()).map_err(|e| format!("malformed coordinates: {e}"))
}

fn polygon_from(rings: Vec<Vec<Vec<f64>>>) -> std::result::Result<Polygon, String> {
    rings
        .into_iter()
        .map(|ring| {
            ring.into_iter()
                .map(|pos| match pos.as_slice() {
                    [x, y] | [x, y, _] => Ok((*x, *y)),
                    other => Err(format!("position has {} coordinate(s)", other.len())),
                })
                .collect::<std::result::Result<Ring, String>>()
        })
        .collect()
}

fn parse_wkt(wkt: &str) -> std::result::Result<Footprint, String> {
    let mut text = wkt.trim();
    if text.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("SRID=")) {
        text = match text.split_once(';') {
            Some((_, rest)) => rest.trim_start(),
            None => return Err("SRID prefix is not followed by ';'".into()),
        };
    }

    let mut parser = WktParser { s: text.as_bytes(), pos: 0 };
    let keyword = parser.word().to_ascii_uppercase();
    let dimension = parser.word().to_ascii_uppercase();
    if !dimension.is_empty() && dimension != "Z" {
        if dimension == "EMPTY" {
            return Err("geometry is empty".into());
        }
        return Err(format!("unsupported dimension {dimension}"));
    }

    let footprint = match keyword.as_str() {
        "POLYGON" => Footprint::Polygon(parser.polygon()?),
        "MULTIPOLYGON" => Footprint::MultiPolygon(parser.list(WktParser::polygon)?),
        "" => return Err("no geometry keyword found".into()),
        other => {
            return Err(format!(
                "unsupported geometry type {other}, a POLYGON or MULTIPOLYGON is required"
            ));
        }
    };

    parser.skip_ws();
    if parser.pos != parser.s.len() {
        return Err(format!("unexpected trailing input at offset {}", parser.pos));
    }
    footprint.validate()?;
    Ok(footprint)
}

struct WktParser<'a> {
    s: &'a [u8],
    pos: usize,
}

impl WktParser<'_> {
    fn skip_ws(&mut self) {
        while self.pos < self.s.len() && self.s[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn word(&mut self) -> String {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.s.len() && self.s[self.pos].is_ascii_alphabetic() {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.s[start..self.pos]).into_owned()
    }

    fn expect(&mut self, c: u8) -> std::result::Result<(), String> {
        self.skip_ws();
        if self.s.get(self.pos) == Some(&c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(format!("expected '{}' at offset {}", c as char, self.pos))
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.s.get(self.pos).copied()
    }

    /// `( item, item, ... )`
    fn list<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> std::result::Result<T, String>,
    ) -> std::result::Result<Vec<T>, String> {
        self.expect(b'(')?;
        let mut out = vec![item(&mut *self)?];
        while self.peek() == Some(b',') {
            self.pos += 1;
            out.push(item(&mut *self)?);
        }
        self.expect(b')')?;
        Ok(out)
    }

    fn polygon(&mut self) -> std::result::Result<Polygon, String> {
        self.list(|p| p.list(WktParser::position))
    }

    fn position(&mut self) -> std::result::Result<Position, String> {
        let x = self.number()?;
        let y = self.number()?;
        if matches!(self.peek(), Some(c) if c != b',' && c != b')') {
            // Z coordinate
            self.number()?;
        }
        Ok((x, y))
    }

    fn number(&mut self) -> std::result::Result<f64, String> {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.s.len()
            && matches!(self.s[self.pos], b'0'..=b'9' | b'+' | b'-' | b'.' | b'e' | b'E')
        {
            self.pos += 1;
        }
        let raw = std::str::from_utf8(&self.s[start..self.pos]).unwrap_or_default();
        raw.parse()
            .map_err(|_| format!("expected a number at offset {start}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn geojson_polygon_to_wkt() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "aoi.geojson",
            r#"{"type":"Polygon","coordinates":[[[40,-20],[40,-15],[30,-15],[30,-20],[40,-20]]]}"#,
        );
        assert_eq!(
            to_wkt(&path).unwrap(),
            "POLYGON((40 -20,40 -15,30 -15,30 -20,40 -20))"
        );
    }

    #[test]
    fn single_feature_collection_and_multipolygon() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "aoi.geojson",
            r#"{"type":"FeatureCollection","features":[{"type":"Feature","properties":{},
                "geometry":{"type":"MultiPolygon","coordinates":[
                    [[[0,0,5],[1,0,5],[1,1,5],[0,0,5]]],
                    [[[10.5,10],[11,10],[11,11],[10.5,10]]]]}}]}"#,
        );
        assert_eq!(
            to_wkt(&path).unwrap(),
            "MULTIPOLYGON(((0 0,1 0,1 1,0 0)),((10.5 10,11 10,11 11,10.5 10)))"
        );
    }

    #[test]
    fn wkt_file_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "aoi.wkt",
            "SRID=4326;polygon ( (40 -20, 40 -15, 30 -15, 30 -20, 40 -20), (35 -18, 36 -18, 36 -17, 35 -18) )\n",
        );
        assert_eq!(
            to_wkt(&path).unwrap(),
            "POLYGON((40 -20,40 -15,30 -15,30 -20,40 -20),(35 -18,36 -18,36 -17,35 -18))"
        );
    }

    #[test]
    fn point_geometry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "point.geojson", r#"{"type":"Point","coordinates":[40,-20]}"#);
        let before: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();

        let err = to_wkt(&path).unwrap_err();
        match err {
            Error::GeometryFormat { path: p, reason } => {
                assert_eq!(p, path);
                assert!(reason.contains("Point"), "{reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        let after: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(before.len(), after.len());
    }

    #[test]
    fn malformed_and_empty_inputs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in [
            ("empty.geojson", "   \n"),
            ("broken.geojson", r#"{"type":"Polygon","coordinates":[[[40,-20],"#),
            ("open.geojson", r#"{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,1]]]}"#),
            ("short.geojson", r#"{"type":"Polygon","coordinates":[[[0,0],[1,0],[0,0]]]}"#),
            ("many.geojson", r#"{"type":"FeatureCollection","features":[
                {"type":"Feature","geometry":{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,0]]]}},
                {"type":"Feature","geometry":{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,0]]]}}]}"#),
            ("nogeom.geojson", r#"{"type":"Feature","geometry":null}"#),
            ("point.wkt", "POINT(1 2)"),
            ("line.wkt", "LINESTRING(0 0, 1 1)"),
            ("trailing.wkt", "POLYGON((0 0,1 0,1 1,0 0)) junk"),
            ("empty.wkt", "POLYGON EMPTY"),
        ] {
            let path = write(&dir, name, content);
            assert!(
                matches!(to_wkt(&path), Err(Error::GeometryFormat { .. })),
                "{name} should be rejected"
            );
        }
        assert!(matches!(
            to_wkt(dir.path().join("missing.geojson")),
            Err(Error::GeometryFormat { .. })
        ));
    }

    #[test]
    fn validate_wkt_accepts_spaced_polygons() {
        assert!(validate_wkt("POLYGON((40 -20, 40 -15, 30 -15, 30 -20, 40 -20))").is_ok());
        assert!(validate_wkt("MULTIPOLYGON(((0 0,1 0,1 1,0 0)))").is_ok());
        assert!(validate_wkt("POLYGON((0 0,1 0,1 1))").is_err());
    }
}
