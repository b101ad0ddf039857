//! Import definitions for every entity the daemon can reconcile.
//!
//! Field order matters: required fields are checked in declaration order and
//! only the first missing one is reported for a row.

use crate::coerce::FieldValue;

#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    Text,
    Date,
    Integer { min: Option<i64>, max: Option<i64> },
    Decimal,
    IdList,
    Choice(&'static [(&'static str, &'static str)]),
}

impl FieldKind {
    pub fn label(self) -> &'static str {
        match self {
            FieldKind::Text | FieldKind::Choice(_) => "text",
            FieldKind::Date => "date",
            FieldKind::Integer { .. } | FieldKind::Decimal => "number",
            FieldKind::IdList => "idList",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum DefaultValue {
    Int(i64),
    Float(f64),
    Text(&'static str),
    EmptyList,
}

impl DefaultValue {
    pub fn to_field_value(self) -> FieldValue {
        match self {
            DefaultValue::Int(v) => FieldValue::Int(v),
            DefaultValue::Float(v) => FieldValue::Float(v),
            DefaultValue::Text(s) => FieldValue::Text(s.to_string()),
            DefaultValue::EmptyList => FieldValue::IdList(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub kind: FieldKind,
    /// Message reported when the cell is blank. `None` means optional.
    pub required: Option<&'static str>,
    /// Message reported when the cell is present but cannot be coerced and
    /// there is no default to fall back on.
    pub invalid: &'static str,
    pub default: Option<DefaultValue>,
}

/// A code column in the imported row resolved against another table.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceSpec {
    pub code_field: &'static str,
    pub table: &'static str,
    pub code_column: &'static str,
    pub id_field: &'static str,
    /// (column in referenced table, field written on the imported record)
    pub copy: &'static [(&'static str, &'static str)],
    /// Message prefix for unknown codes, followed by the code.
    pub missing: &'static str,
    /// An unknown code fails the row. Otherwise the id is left null and the
    /// row carries a warning.
    pub required: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ActorStamp {
    pub field: &'static str,
    pub required: bool,
}

#[derive(Debug)]
pub struct EntitySpec {
    pub name: &'static str,
    pub label: &'static str,
    pub table: &'static str,
    pub natural_key: &'static [&'static str],
    pub fields: &'static [FieldSpec],
    pub references: &'static [ReferenceSpec],
    pub actor: Option<ActorStamp>,
    pub updated_at_field: Option<&'static str>,
    pub order_by: &'static str,
}

impl EntitySpec {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_id_list(&self, column: &str) -> bool {
        self.field(column)
            .is_some_and(|f| matches!(f.kind, FieldKind::IdList))
    }
}

const fn required(
    name: &'static str,
    label: &'static str,
    kind: FieldKind,
    message: &'static str,
    invalid: &'static str,
) -> FieldSpec {
    FieldSpec {
        name,
        label,
        kind,
        required: Some(message),
        invalid,
        default: None,
    }
}

const fn optional(
    name: &'static str,
    label: &'static str,
    kind: FieldKind,
    invalid: &'static str,
) -> FieldSpec {
    FieldSpec {
        name,
        label,
        kind,
        required: None,
        invalid,
        default: None,
    }
}

const fn defaulted(
    name: &'static str,
    label: &'static str,
    kind: FieldKind,
    default: DefaultValue,
) -> FieldSpec {
    FieldSpec {
        name,
        label,
        kind,
        required: None,
        invalid: "",
        default: Some(default),
    }
}

const fn text(name: &'static str, label: &'static str) -> FieldSpec {
    optional(name, label, FieldKind::Text, "")
}

const ANY_INT: FieldKind = FieldKind::Integer {
    min: None,
    max: None,
};
const POSITIVE_INT: FieldKind = FieldKind::Integer {
    min: Some(1),
    max: None,
};

pub static KY_THI: EntitySpec = EntitySpec {
    name: "ky_thi",
    label: "kỳ thi",
    table: "dao_tao_ky_thi",
    natural_key: &["ten_ky_thi", "ngay"],
    fields: &[
        required(
            "ngay",
            "Ngày",
            FieldKind::Date,
            "Ngày là bắt buộc",
            "Ngày không hợp lệ",
        ),
        required(
            "ten_ky_thi",
            "Tên kỳ thi",
            FieldKind::Text,
            "Tên kỳ thi là bắt buộc",
            "Tên kỳ thi không hợp lệ",
        ),
        defaulted(
            "trang_thai",
            "Trạng thái",
            FieldKind::Text,
            DefaultValue::Text("Mở"),
        ),
        defaulted(
            "so_cau_hoi",
            "Số câu hỏi",
            POSITIVE_INT,
            DefaultValue::Int(10),
        ),
        defaulted(
            "so_phut_lam_bai",
            "Số phút làm bài",
            POSITIVE_INT,
            DefaultValue::Int(15),
        ),
        defaulted(
            "nhom_chuyen_de_ids",
            "Nhóm chuyên đề IDs",
            FieldKind::IdList,
            DefaultValue::EmptyList,
        ),
        defaulted(
            "chuyen_de_ids",
            "Chuyên đề IDs",
            FieldKind::IdList,
            DefaultValue::EmptyList,
        ),
        optional("chuc_vu_ids", "Chức vụ IDs", FieldKind::IdList, ""),
        text("ghi_chu", "Ghi chú"),
    ],
    references: &[],
    actor: Some(ActorStamp {
        field: "nguoi_tao_id",
        required: true,
    }),
    updated_at_field: Some("tg_cap_nhat"),
    order_by: "ngay DESC, id DESC",
};

pub static CHAM_OLE: EntitySpec = EntitySpec {
    name: "cham_ole",
    label: "chấm OLE",
    table: "ole_cham_diem",
    natural_key: &["nhan_vien_id", "nam", "thang"],
    fields: &[
        required(
            "nhan_vien_id",
            "Mã nhân viên",
            POSITIVE_INT,
            "Mã nhân viên là bắt buộc và phải là số",
            "Mã nhân viên là bắt buộc và phải là số",
        ),
        required(
            "nam",
            "Năm",
            FieldKind::Integer {
                min: Some(1900),
                max: Some(9999),
            },
            "Năm là bắt buộc và phải là số",
            "Năm là bắt buộc và phải là số",
        ),
        required(
            "thang",
            "Tháng",
            FieldKind::Integer {
                min: Some(1),
                max: Some(12),
            },
            "Tháng là bắt buộc và phải là số",
            "Tháng phải từ 1 đến 12",
        ),
        optional("phong_id", "ID phòng", ANY_INT, "ID phòng phải là số"),
        optional("nhom_id", "ID nhóm", ANY_INT, "ID nhóm phải là số"),
        optional("chuc_vu_id", "ID chức vụ", ANY_INT, "ID chức vụ phải là số"),
        text("danh_gia", "Đánh giá"),
        optional("ole", "Điểm OLE", FieldKind::Decimal, "Điểm OLE phải là số"),
        optional("kpi", "Điểm KPI", FieldKind::Decimal, "Điểm KPI phải là số"),
        optional("cong", "Điểm cộng", FieldKind::Decimal, "Điểm cộng phải là số"),
        optional("tru", "Điểm trừ", FieldKind::Decimal, "Điểm trừ phải là số"),
        text("ghi_chu", "Ghi chú"),
    ],
    references: &[],
    actor: None,
    updated_at_field: Some("tg_cap_nhat"),
    order_by: "nam DESC, thang DESC, nhan_vien_id",
};

pub static DIEM_CONG_TRU: EntitySpec = EntitySpec {
    name: "diem_cong_tru",
    label: "điểm cộng trừ",
    table: "ole_diem_cong_tru",
    natural_key: &["nhan_vien_id", "ngay"],
    fields: &[
        required(
            "nhan_vien_id",
            "Mã nhân viên",
            POSITIVE_INT,
            "Mã nhân viên là bắt buộc và phải là số",
            "Mã nhân viên là bắt buộc và phải là số",
        ),
        text("ho_va_ten", "Họ và tên"),
        required(
            "ngay",
            "Ngày",
            FieldKind::Date,
            "Ngày là bắt buộc",
            "Ngày không hợp lệ",
        ),
        optional("phong_ban_id", "ID phòng ban", ANY_INT, "ID phòng ban phải là số"),
        text("loai", "Loại"),
        text("nhom", "Nhóm"),
        defaulted("diem", "Điểm", FieldKind::Decimal, DefaultValue::Float(0.0)),
        defaulted("tien", "Tiền", FieldKind::Decimal, DefaultValue::Float(0.0)),
        optional(
            "nhom_luong_id",
            "ID nhóm lương",
            ANY_INT,
            "ID nhóm lương phải là số",
        ),
        text("ten_nhom_luong", "Tên nhóm lương"),
        text("mo_ta", "Mô tả"),
        text("trang_thai", "Trạng thái"),
    ],
    references: &[],
    actor: Some(ActorStamp {
        field: "nguoi_tao_id",
        required: false,
    }),
    updated_at_field: Some("tg_cap_nhat"),
    order_by: "ngay DESC, id DESC",
};

pub static PHONG_BAN: EntitySpec = EntitySpec {
    name: "phong_ban",
    label: "phòng ban",
    table: "ole_phong_ban",
    natural_key: &["ma_phong_ban"],
    fields: &[
        required(
            "tt",
            "Thứ tự",
            ANY_INT,
            "Thứ tự là bắt buộc và phải là số",
            "Thứ tự là bắt buộc và phải là số",
        ),
        required(
            "ma_phong_ban",
            "Mã phòng ban",
            FieldKind::Text,
            "Mã phòng ban là bắt buộc",
            "Mã phòng ban không hợp lệ",
        ),
        required(
            "ten_phong_ban",
            "Tên phòng ban",
            FieldKind::Text,
            "Tên phòng ban là bắt buộc",
            "Tên phòng ban không hợp lệ",
        ),
        required(
            "cap_do",
            "Cấp độ",
            FieldKind::Text,
            "Cấp độ là bắt buộc",
            "Cấp độ không hợp lệ",
        ),
        text("truc_thuoc_ma", "Mã trực thuộc"),
    ],
    references: &[ReferenceSpec {
        code_field: "truc_thuoc_ma",
        table: "ole_phong_ban",
        code_column: "ma_phong_ban",
        id_field: "truc_thuoc_id",
        copy: &[("ten_phong_ban", "truc_thuoc_phong_ban")],
        missing: "Không tìm thấy phòng ban trực thuộc với mã",
        required: false,
    }],
    actor: None,
    updated_at_field: Some("tg_cap_nhat"),
    order_by: "tt, id",
};

const MIEN_ALIASES: &[(&str, &str)] = &[
    ("Bắc", "Miền Bắc"),
    ("Trung", "Miền Trung"),
    ("Nam", "Miền Nam"),
    ("Miền Bắc", "Miền Bắc"),
    ("Miền Trung", "Miền Trung"),
    ("Miền Nam", "Miền Nam"),
];

pub static TINH_THANH_SSN: EntitySpec = EntitySpec {
    name: "tinh_thanh_ssn",
    label: "tỉnh thành SSN",
    table: "var_ssn_tinh_thanh",
    natural_key: &["ma_tinh_thanh"],
    fields: &[
        required(
            "ma_tinh_thanh",
            "Mã tỉnh thành",
            FieldKind::Text,
            "Mã tỉnh thành là bắt buộc",
            "Mã tỉnh thành không hợp lệ",
        ),
        required(
            "ten_tinh_thanh",
            "Tên tỉnh thành",
            FieldKind::Text,
            "Tên tỉnh thành là bắt buộc",
            "Tên tỉnh thành không hợp lệ",
        ),
        required(
            "mien",
            "Miền",
            FieldKind::Choice(MIEN_ALIASES),
            "Miền là bắt buộc",
            "Miền không hợp lệ. Phải là: Miền Bắc, Miền Trung, hoặc Miền Nam",
        ),
        required(
            "vung",
            "Vùng",
            FieldKind::Text,
            "Vùng là bắt buộc",
            "Vùng không hợp lệ",
        ),
    ],
    references: &[],
    actor: None,
    updated_at_field: Some("tg_cap_nhat"),
    order_by: "ma_tinh_thanh",
};

pub static PHUONG_XA_SNN: EntitySpec = EntitySpec {
    name: "phuong_xa_snn",
    label: "phường xã SNN",
    table: "var_ssn_phuong_xa",
    natural_key: &["ma_phuong_xa"],
    fields: &[
        required(
            "ma_tinh_thanh",
            "Mã tỉnh thành",
            FieldKind::Text,
            "Mã tỉnh thành là bắt buộc",
            "Mã tỉnh thành không hợp lệ",
        ),
        required(
            "ma_phuong_xa",
            "Mã phường xã",
            FieldKind::Text,
            "Mã phường xã là bắt buộc",
            "Mã phường xã không hợp lệ",
        ),
        required(
            "ten_phuong_xa",
            "Tên phường xã",
            FieldKind::Text,
            "Tên phường xã là bắt buộc",
            "Tên phường xã không hợp lệ",
        ),
    ],
    references: &[ReferenceSpec {
        code_field: "ma_tinh_thanh",
        table: "var_ssn_tinh_thanh",
        code_column: "ma_tinh_thanh",
        id_field: "tinh_thanh_id",
        copy: &[("ten_tinh_thanh", "ten_tinh_thanh")],
        missing: "Không tìm thấy tỉnh thành với mã",
        required: true,
    }],
    actor: None,
    updated_at_field: Some("tg_cap_nhat"),
    order_by: "ma_tinh_thanh, ma_phuong_xa",
};

pub static ENTITIES: [&EntitySpec; 6] = [
    &KY_THI,
    &CHAM_OLE,
    &DIEM_CONG_TRU,
    &PHONG_BAN,
    &TINH_THANH_SSN,
    &PHUONG_XA_SNN,
];

pub fn find(name: &str) -> Option<&'static EntitySpec> {
    ENTITIES.iter().copied().find(|e| e.name == name)
}

/// Describes an entity for import templates and column auto-mapping.
pub fn describe(entity: &EntitySpec) -> serde_json::Value {
    let fields = entity
        .fields
        .iter()
        .map(|f| {
            serde_json::json!({
                "name": f.name,
                "label": f.label,
                "type": f.kind.label(),
                "required": f.required.is_some(),
                "default": f.default.map(|d| d.to_field_value().to_json()),
            })
        })
        .collect::<Vec<_>>();
    serde_json::json!({
        "name": entity.name,
        "label": entity.label,
        "table": entity.table,
        "naturalKey": entity.natural_key,
        "fields": fields,
        "requiresActor": entity.actor.is_some_and(|a| a.required),
    })
}
