pub const FALLBACK_CATEGORY: &str = "Uncategorized";
pub const FALLBACK_RECOMMENDATION: &str = "Manual review";

#[derive(Debug, Clone, Copy)]
pub struct TaxonomyEntry {
    pub label: &'static str,
    pub hint: &'static str,
}

pub const RETURN_CATEGORIES: [TaxonomyEntry; 10] = [
    TaxonomyEntry {
        label: "Appearance Difference",
        hint: "color, pattern or finish differs from the listing photos",
    },
    TaxonomyEntry {
        label: "Quality Issues",
        hint: "defects, cracks, scratches or premature wear",
    },
    TaxonomyEntry {
        label: "Size Mismatch",
        hint: "fit or dimensions do not match what the customer expected",
    },
    TaxonomyEntry {
        label: "Performance Below Expectations",
        hint: "works, but slower, weaker or shorter-lived than advertised",
    },
    TaxonomyEntry {
        label: "Wrong Item Received",
        hint: "different model, variant or product was shipped",
    },
    TaxonomyEntry {
        label: "Logistics Issues",
        hint: "damaged packaging or item damaged in transit",
    },
    TaxonomyEntry {
        label: "Customer Changed Mind",
        hint: "no fault with the item, customer no longer wants it",
    },
    TaxonomyEntry {
        label: "Missing Accessories",
        hint: "cables, manuals, parts or bundled items absent",
    },
    TaxonomyEntry {
        label: "Allergic/Adverse Reaction",
        hint: "skin reaction, irritation or other adverse effect",
    },
    TaxonomyEntry {
        label: "Delayed Delivery",
        hint: "arrived too late to be useful",
    },
];

pub const DISPOSITIONS: [TaxonomyEntry; 10] = [
    TaxonomyEntry {
        label: "Direct Resale",
        hint: "unused and undamaged, relist as new",
    },
    TaxonomyEntry {
        label: "Discounted Sale",
        hint: "minor cosmetic issues, relist at a reduced price",
    },
    TaxonomyEntry {
        label: "Return to Supplier",
        hint: "manufacturing defect covered by the vendor",
    },
    TaxonomyEntry {
        label: "Repair and Resell",
        hint: "fixable fault, refurbish before relisting",
    },
    TaxonomyEntry {
        label: "Parts Recycling",
        hint: "not repairable, salvage components",
    },
    TaxonomyEntry {
        label: "Charity Donation",
        hint: "usable but not worth relisting",
    },
    TaxonomyEntry {
        label: "Environmental Disposal",
        hint: "unsafe or unusable, dispose responsibly",
    },
    TaxonomyEntry {
        label: "Cross-platform Direct Sales",
        hint: "better value on a secondary marketplace",
    },
    TaxonomyEntry {
        label: "Bundle Sales",
        hint: "sell together with complementary items",
    },
    TaxonomyEntry {
        label: "Convert to Sample/Display Item",
        hint: "keep for showroom or sampling",
    },
];

pub fn is_known_category(label: &str) -> bool {
    RETURN_CATEGORIES
        .iter()
        .any(|entry| entry.label.eq_ignore_ascii_case(label.trim()))
}

pub fn is_known_disposition(label: &str) -> bool {
    DISPOSITIONS
        .iter()
        .any(|entry| entry.label.eq_ignore_ascii_case(label.trim()))
}

pub fn prompt_block(entries: &[TaxonomyEntry]) -> String {
    entries
        .iter()
        .map(|entry| format!("- {}: {}", entry.label, entry.hint))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_ignore_case_and_padding() {
        assert!(is_known_category(" quality issues "));
        assert!(is_known_disposition("Repair and Resell"));
        assert!(!is_known_category("Manual review"));
        assert!(!is_known_disposition(FALLBACK_RECOMMENDATION));
    }

    #[test]
    fn prompt_block_lists_every_entry() {
        let block = prompt_block(&DISPOSITIONS);
        assert_eq!(block.lines().count(), DISPOSITIONS.len());
        assert!(block.starts_with("- Direct Resale:"));
    }
}
