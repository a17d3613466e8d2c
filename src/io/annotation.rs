use crate::types::{InsarError, InsarResult, OrbitData, RadarGeometry, StateVector, TiePoint};
use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::de::from_str;
use serde::Deserialize;

/// Sentinel-1 product annotation; the root <product> element.
/// Only the fields the interferometric chain needs are mapped.
#[derive(Debug, Deserialize)]
pub struct AnnotationRoot {
    #[serde(rename = "adsHeader")]
    pub ads_header: AdsHeader,
    #[serde(rename = "generalAnnotation")]
    pub general_annotation: Option<GeneralAnnotation>,
    #[serde(rename = "imageAnnotation")]
    pub image_annotation: ImageAnnotation,
    #[serde(rename = "geolocationGrid")]
    pub geolocation_grid: Option<GeolocationGrid>,
}

#[derive(Debug, Deserialize)]
pub struct AdsHeader {
    #[serde(rename = "missionId")]
    pub mission_id: String,
    #[serde(rename = "polarisation")]
    pub polarisation: Option<String>,
    #[serde(rename = "swath")]
    pub swath: Option<String>,
    #[serde(rename = "startTime")]
    pub start_time: String,
}

#[derive(Debug, Deserialize)]
pub struct GeneralAnnotation {
    #[serde(rename = "productInformation")]
    pub product_information: Option<ProductInformation>,
    #[serde(rename = "orbitList")]
    pub orbit_list: Option<OrbitList>,
}

#[derive(Debug, Deserialize)]
pub struct ProductInformation {
    #[serde(rename = "radarFrequency")]
    pub radar_frequency: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct OrbitList {
    #[serde(rename = "orbit", default)]
    pub orbits: Vec<OrbitRecord>,
}

#[derive(Debug, Deserialize)]
pub struct OrbitRecord {
    pub time: String,
    pub position: Xyz,
    pub velocity: Xyz,
}

#[derive(Debug, Deserialize)]
pub struct Xyz {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Deserialize)]
pub struct ImageAnnotation {
    #[serde(rename = "imageInformation")]
    pub image_information: ImageInformation,
}

#[derive(Debug, Deserialize)]
pub struct ImageInformation {
    #[serde(rename = "productFirstLineUtcTime")]
    pub product_first_line_utc_time: String,
    #[serde(rename = "slantRangeTime")]
    pub slant_range_time: f64,
    #[serde(rename = "rangePixelSpacing")]
    pub range_pixel_spacing: f64,
    #[serde(rename = "azimuthPixelSpacing")]
    pub azimuth_pixel_spacing: f64,
    #[serde(rename = "azimuthTimeInterval")]
    pub azimuth_time_interval: f64,
    #[serde(rename = "numberOfSamples")]
    pub number_of_samples: usize,
    #[serde(rename = "numberOfLines")]
    pub number_of_lines: usize,
}

/// Geolocation grid for geographic coordinate extraction
#[derive(Debug, Deserialize)]
pub struct GeolocationGrid {
    #[serde(rename = "geolocationGridPointList")]
    pub geolocation_grid_point_list: GeolocationGridPointList,
}

#[derive(Debug, Deserialize)]
pub struct GeolocationGridPointList {
    #[serde(rename = "geolocationGridPoint", default)]
    pub geolocation_grid_points: Vec<GeolocationGridPoint>,
}

#[derive(Debug, Deserialize)]
pub struct GeolocationGridPoint {
    #[serde(rename = "line")]
    pub line: f64,
    #[serde(rename = "pixel")]
    pub pixel: f64,
    #[serde(rename = "latitude")]
    pub latitude: f64,
    #[serde(rename = "longitude")]
    pub longitude: f64,
    #[serde(rename = "height")]
    pub height: f64,
    #[serde(rename = "incidenceAngle")]
    pub incidence_angle: Option<f64>,
}

/// Parser for Sentinel-1 annotation XML files
pub struct AnnotationParser;

impl AnnotationParser {
    /// Parse complete annotation XML
    pub fn parse_annotation(xml_content: &str) -> InsarResult<AnnotationRoot> {
        from_str::<AnnotationRoot>(xml_content)
            .map_err(|e| InsarError::XmlParsing(format!("Failed to parse annotation XML: {}", e)))
    }

    /// Annotation timestamps carry no zone designator and are UTC
    pub fn parse_time(time_str: &str) -> InsarResult<DateTime<Utc>> {
        let trimmed = time_str.trim().trim_end_matches('Z');
        NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|e| InsarError::Metadata(format!("Invalid annotation time '{}': {}", time_str, e)))
    }

    /// Extract orbit state vectors, if the annotation carries any
    pub fn extract_orbit(annotation: &AnnotationRoot) -> InsarResult<Option<OrbitData>> {
        let records = match annotation
            .general_annotation
            .as_ref()
            .and_then(|g| g.orbit_list.as_ref())
        {
            Some(list) if !list.orbits.is_empty() => &list.orbits,
            _ => return Ok(None),
        };

        let mut state_vectors = Vec::with_capacity(records.len());
        for record in records {
            state_vectors.push(StateVector {
                time: Self::parse_time(&record.time)?,
                position: [record.position.x, record.position.y, record.position.z],
                velocity: [record.velocity.x, record.velocity.y, record.velocity.z],
            });
        }
        state_vectors.sort_by_key(|sv| sv.time);

        let reference_time = state_vectors[0].time;
        Ok(Some(OrbitData {
            state_vectors,
            reference_time,
        }))
    }

    /// Build the radar geometry used by co-registration and geocoding
    pub fn extract_geometry(annotation: &AnnotationRoot) -> InsarResult<RadarGeometry> {
        let info = &annotation.image_annotation.image_information;
        if info.number_of_lines == 0 || info.number_of_samples == 0 {
            return Err(InsarError::Metadata("Annotation reports an empty image".to_string()));
        }
        if info.azimuth_time_interval <= 0.0 || info.range_pixel_spacing <= 0.0 {
            return Err(InsarError::Metadata(format!(
                "Invalid sampling in annotation: azimuthTimeInterval={}, rangePixelSpacing={}",
                info.azimuth_time_interval, info.range_pixel_spacing
            )));
        }

        let tie_points = annotation
            .geolocation_grid
            .as_ref()
            .map(|grid| {
                grid.geolocation_grid_point_list
                    .geolocation_grid_points
                    .iter()
                    .map(|p| TiePoint {
                        line: p.line,
                        pixel: p.pixel,
                        latitude: p.latitude,
                        longitude: p.longitude,
                        height: p.height,
                        incidence_angle: p.incidence_angle.unwrap_or(0.0),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(RadarGeometry {
            lines: info.number_of_lines,
            samples: info.number_of_samples,
            first_line_time: Self::parse_time(&info.product_first_line_utc_time)?,
            azimuth_time_interval: info.azimuth_time_interval,
            slant_range_time: info.slant_range_time,
            range_pixel_spacing: info.range_pixel_spacing,
            azimuth_pixel_spacing: info.azimuth_pixel_spacing,
            orbit: Self::extract_orbit(annotation)?,
            tie_points,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<product>
  <adsHeader>
    <missionId>S1A</missionId>
    <productType>SLC</productType>
    <polarisation>VV</polarisation>
    <swath>IW2</swath>
    <startTime>2020-01-03T17:08:16.618328</startTime>
  </adsHeader>
  <generalAnnotation>
    <productInformation>
      <pass>Ascending</pass>
      <radarFrequency>5.405000454334350e+09</radarFrequency>
    </productInformation>
    <orbitList count="2">
      <orbit>
        <time>2020-01-03T17:08:20.000000</time>
        <frame>Earth Fixed</frame>
        <position><x>4.0e6</x><y>1.0e6</y><z>5.5e6</z></position>
        <velocity><x>1.0e3</x><y>-2.0e3</y><z>7.0e3</z></velocity>
      </orbit>
      <orbit>
        <time>2020-01-03T17:08:10.000000</time>
        <frame>Earth Fixed</frame>
        <position><x>3.99e6</x><y>1.02e6</y><z>5.43e6</z></position>
        <velocity><x>1.0e3</x><y>-2.0e3</y><z>7.0e3</z></velocity>
      </orbit>
    </orbitList>
  </generalAnnotation>
  <imageAnnotation>
    <imageInformation>
      <productFirstLineUtcTime>2020-01-03T17:08:16.618328</productFirstLineUtcTime>
      <slantRangeTime>5.331e-03</slantRangeTime>
      <rangePixelSpacing>2.329562</rangePixelSpacing>
      <azimuthPixelSpacing>13.97</azimuthPixelSpacing>
      <azimuthTimeInterval>2.055556e-03</azimuthTimeInterval>
      <numberOfSamples>200</numberOfSamples>
      <numberOfLines>100</numberOfLines>
    </imageInformation>
  </imageAnnotation>
  <geolocationGrid>
    <geolocationGridPointList count="1">
      <geolocationGridPoint>
        <azimuthTime>2020-01-03T17:08:16.618328</azimuthTime>
        <slantRangeTime>5.331e-03</slantRangeTime>
        <line>0</line>
        <pixel>0</pixel>
        <latitude>44.9</latitude>
        <longitude>4.1</longitude>
        <height>120.5</height>
        <incidenceAngle>33.2</incidenceAngle>
      </geolocationGridPoint>
    </geolocationGridPointList>
  </geolocationGrid>
</product>"#;

    #[test]
    fn test_annotation_parsing() {
        let root = AnnotationParser::parse_annotation(SAMPLE_XML).unwrap();
        assert_eq!(root.ads_header.mission_id, "S1A");

        let geometry = AnnotationParser::extract_geometry(&root).unwrap();
        assert_eq!(geometry.lines, 100);
        assert_eq!(geometry.samples, 200);
        assert_eq!(geometry.tie_points.len(), 1);
        assert_eq!(geometry.tie_points[0].incidence_angle, 33.2);

        // State vectors come back sorted by time
        let orbit = geometry.orbit.unwrap();
        assert_eq!(orbit.state_vectors.len(), 2);
        assert!(orbit.state_vectors[0].time < orbit.state_vectors[1].time);
    }

    #[test]
    fn test_parse_time_without_zone() {
        let t = AnnotationParser::parse_time("2020-01-03T17:08:16.618328").unwrap();
        assert_eq!(t.to_rfc3339(), "2020-01-03T17:08:16.618328+00:00");
    }
}
