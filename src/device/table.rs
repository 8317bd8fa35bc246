//! Operator-facing table projection of a device's points.

use std::sync::Arc;

use serde::Serialize;

use crate::core::point::Point;

/// One row of the operator table.
#[derive(Debug, Clone, Serialize)]
pub struct TableRow {
    pub address: String,
    pub hex_address: String,
    pub bit: String,
    pub function_code: String,
    pub decode_code: String,
    pub name: String,
    pub code: String,
    pub hex_value: String,
    pub value: String,
    pub mul_coe: String,
    pub add_coe: String,
    pub frame_type: String,
}

/// Query parameters of a table projection.
#[derive(Debug, Clone, Default)]
pub struct TableQuery {
    /// Substring filter on the point name.
    pub name: Option<String>,
    /// 1-based page index; `None` disables pagination.
    pub page_index: Option<usize>,
    pub page_size: Option<usize>,
    /// Frame types to include; empty means all.
    pub frame_types: Vec<u8>,
    /// Blank value columns of stale points instead of showing numbers.
    pub mask_errors: bool,
}

/// Project points into rows, filtered, masked and paginated.
///
/// Returns the page plus the total row count before pagination.
pub fn project(points: &[Arc<Point>], query: &TableQuery) -> (Vec<TableRow>, usize) {
    let mut rows: Vec<TableRow> = points
        .iter()
        .filter(|p| {
            query
                .name
                .as_deref()
                .map(|needle| p.name().contains(needle))
                .unwrap_or(true)
        })
        .filter(|p| {
            query.frame_types.is_empty() || query.frame_types.contains(&p.kind().frame_type())
        })
        .map(|p| row_of(p, query.mask_errors))
        .collect();

    let total = rows.len();
    if let (Some(page_index), Some(page_size)) = (query.page_index, query.page_size) {
        let start = page_index.saturating_sub(1) * page_size;
        rows = rows.into_iter().skip(start).take(page_size).collect();
    }
    (rows, total)
}

fn row_of(point: &Arc<Point>, mask_errors: bool) -> TableRow {
    let scaled = point.kind().is_scaled();
    let masked = mask_errors && !point.validity().is_fresh();

    let (value, hex_value) = if masked {
        (String::new(), String::new())
    } else if scaled {
        (point.real_value().to_string(), point.hex_value())
    } else {
        (point.raw_value().to_string(), point.hex_value())
    };

    TableRow {
        address: point.address().to_string(),
        hex_address: point.hex_address(),
        bit: point.bit().map(|b| b.to_string()).unwrap_or_default(),
        function_code: point.function_code().to_string(),
        decode_code: format!("0x{:02X}", point.decode_code()),
        name: point.name(),
        code: point.code().to_string(),
        hex_value,
        value,
        mul_coe: if scaled {
            point.scaling().mul_coe.to_string()
        } else {
            "1".to_string()
        },
        add_coe: if scaled {
            point.scaling().add_coe.to_string()
        } else {
            "0".to_string()
        },
        frame_type: point.kind().label().to_string(),
    }
}

/// The table header, in row order.
pub fn table_head() -> Vec<&'static str> {
    vec![
        "地址",
        "16进制地址",
        "位",
        "功能码",
        "解析码",
        "测点名称",
        "测点编码",
        "寄存器值",
        "真实值",
        "乘法系数",
        "加法系数",
        "帧类型",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::point::PointKind;
    use crate::core::validity::Validity;

    fn sample_points() -> Vec<Arc<Point>> {
        let a = Point::builder(PointKind::Analog, "pv1", 1, 0, 3)
            .name("电压A")
            .decode_code(0x21)
            .scaling(0.1, 0.0)
            .build();
        a.set_raw(2305);
        let b = Point::builder(PointKind::Signal, "sw1", 1, 1, 1)
            .name("开关")
            .build();
        b.set_raw(1);
        vec![a, b]
    }

    #[test]
    fn test_projection_values() {
        let points = sample_points();
        let (rows, total) = project(&points, &TableQuery::default());
        assert_eq!(total, 2);
        assert_eq!(rows[0].value, "230.5");
        assert_eq!(rows[0].frame_type, "遥测");
        assert_eq!(rows[1].value, "1");
        assert_eq!(rows[1].mul_coe, "1");
    }

    #[test]
    fn test_name_filter() {
        let points = sample_points();
        let query = TableQuery {
            name: Some("开关".into()),
            ..Default::default()
        };
        let (rows, total) = project(&points, &query);
        assert_eq!(total, 1);
        assert_eq!(rows[0].code, "sw1");
    }

    #[test]
    fn test_frame_type_filter() {
        let points = sample_points();
        let query = TableQuery {
            frame_types: vec![0],
            ..Default::default()
        };
        let (_, total) = project(&points, &query);
        assert_eq!(total, 1);
    }

    #[test]
    fn test_pagination() {
        let points = sample_points();
        let query = TableQuery {
            page_index: Some(2),
            page_size: Some(1),
            ..Default::default()
        };
        let (rows, total) = project(&points, &query);
        assert_eq!(total, 2);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].code, "sw1");
    }

    #[test]
    fn test_mask_errors_blanks_stale_rows() {
        let points = sample_points();
        points[0].set_validity(Validity::Stale);
        points[1].set_validity(Validity::Fresh);
        let query = TableQuery {
            mask_errors: true,
            ..Default::default()
        };
        let (rows, _) = project(&points, &query);
        assert_eq!(rows[0].value, "");
        assert_eq!(rows[0].hex_value, "");
        assert_eq!(rows[1].value, "1");
    }
}
