//! Skeletal region tables shared by the detector and the maturity classifier.

/// One class the detector reports, with the box count a well-formed hand
/// radiograph is expected to produce for it.
pub struct DetectClass {
    pub id: i32,
    pub name: &'static str,
    pub expected_count: usize,
}

pub const DETECT_CLASSES: [DetectClass; 7] = [
    DetectClass { id: 0, name: "Radius", expected_count: 1 },
    DetectClass { id: 1, name: "Ulna", expected_count: 1 },
    DetectClass { id: 2, name: "FMCP", expected_count: 1 },
    DetectClass { id: 3, name: "MCP", expected_count: 4 },
    DetectClass { id: 4, name: "PIP", expected_count: 5 },
    DetectClass { id: 5, name: "MIP", expected_count: 4 },
    DetectClass { id: 6, name: "DIP", expected_count: 5 },
];

/// One category the classifier scores, with the number of maturity stages it
/// distinguishes.
pub struct ClsCategory {
    pub id: i32,
    pub name: &'static str,
    pub maturity_range: i32,
}

pub const CLS_CATEGORIES: [ClsCategory; 9] = [
    ClsCategory { id: 0, name: "Radius", maturity_range: 14 },
    ClsCategory { id: 1, name: "Ulna", maturity_range: 12 },
    ClsCategory { id: 2, name: "MCPFirst", maturity_range: 11 },
    ClsCategory { id: 3, name: "MCP", maturity_range: 10 },
    ClsCategory { id: 4, name: "PIPFirst", maturity_range: 12 },
    ClsCategory { id: 5, name: "PIP", maturity_range: 12 },
    ClsCategory { id: 6, name: "MIP", maturity_range: 12 },
    ClsCategory { id: 7, name: "DIPFirst", maturity_range: 11 },
    ClsCategory { id: 8, name: "DIP", maturity_range: 11 },
];

/// The thirteen key joints a complete assessment reports, indexed by joint id.
pub const KEY_JOINTS: [&str; 13] = [
    "radius",
    "ulna",
    "mcpfirst",
    "mcpthird",
    "mcpfifth",
    "pipfirst",
    "pipthird",
    "pipfifth",
    "mipthird",
    "mipfifth",
    "dipfirst",
    "dipthird",
    "dipfifth",
];

pub fn detect_class(id: i32) -> Option<&'static DetectClass> {
    DETECT_CLASSES.iter().find(|class| class.id == id)
}

pub fn category(id: i32) -> Option<&'static ClsCategory> {
    CLS_CATEGORIES.iter().find(|category| category.id == id)
}

#[inline]
pub fn joint_name(joint_id: usize) -> &'static str {
    KEY_JOINTS[joint_id]
}

pub fn maturity_range(category_id: i32) -> Option<i32> {
    category(category_id).map(|category| category.maturity_range)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_class_lookup() {
        let mcp = detect_class(3).unwrap();
        assert_eq!(mcp.name, "MCP");
        assert_eq!(mcp.expected_count, 4);
        assert!(detect_class(7).is_none());
    }

    #[test]
    fn test_category_lookup() {
        assert_eq!(category(4).unwrap().name, "PIPFirst");
        assert_eq!(maturity_range(0), Some(14));
        assert_eq!(maturity_range(99), None);
    }

    #[test]
    fn test_expected_boxes_cover_all_joints() {
        // 21 boxes reduce to the 13 canonical joints.
        let total: usize = DETECT_CLASSES
            .iter()
            .map(|class| class.expected_count)
            .sum();
        assert_eq!(total, 21);
        assert_eq!(KEY_JOINTS.len(), 13);
    }
}
