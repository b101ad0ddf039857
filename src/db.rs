use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("hrimport.sqlite3");
    let conn = Connection::open(db_path)?;
    migrate(&conn)?;
    Ok(conn)
}

pub fn migrate(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS dao_tao_ky_thi(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ngay TEXT NOT NULL,
            ten_ky_thi TEXT NOT NULL,
            trang_thai TEXT NOT NULL DEFAULT 'Mở',
            so_cau_hoi INTEGER NOT NULL DEFAULT 10,
            so_phut_lam_bai INTEGER NOT NULL DEFAULT 15,
            nhom_chuyen_de_ids TEXT NOT NULL DEFAULT '[]',
            chuyen_de_ids TEXT NOT NULL DEFAULT '[]',
            chuc_vu_ids TEXT,
            ghi_chu TEXT,
            nguoi_tao_id INTEGER,
            tg_tao TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            tg_cap_nhat TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_ky_thi_ten_ngay ON dao_tao_ky_thi(ten_ky_thi, ngay)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ole_cham_diem(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            nhan_vien_id INTEGER NOT NULL,
            nam INTEGER NOT NULL,
            thang INTEGER NOT NULL CHECK(thang BETWEEN 1 AND 12),
            phong_id INTEGER,
            nhom_id INTEGER,
            chuc_vu_id INTEGER,
            danh_gia TEXT,
            ole REAL,
            kpi REAL,
            cong REAL,
            tru REAL,
            ghi_chu TEXT,
            tg_tao TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            tg_cap_nhat TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_cham_diem_nv_ky ON ole_cham_diem(nhan_vien_id, nam, thang)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ole_diem_cong_tru(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            nhan_vien_id INTEGER NOT NULL,
            ho_va_ten TEXT,
            ngay TEXT NOT NULL,
            phong_ban_id INTEGER,
            loai TEXT,
            nhom TEXT,
            diem REAL NOT NULL DEFAULT 0,
            tien REAL NOT NULL DEFAULT 0,
            nhom_luong_id INTEGER,
            ten_nhom_luong TEXT,
            mo_ta TEXT,
            trang_thai TEXT,
            nguoi_tao_id INTEGER,
            tg_tao TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            tg_cap_nhat TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_diem_cong_tru_nv_ngay ON ole_diem_cong_tru(nhan_vien_id, ngay)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ole_phong_ban(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tt INTEGER NOT NULL,
            ma_phong_ban TEXT NOT NULL,
            ten_phong_ban TEXT NOT NULL,
            cap_do TEXT NOT NULL,
            truc_thuoc_ma TEXT,
            truc_thuoc_id INTEGER,
            truc_thuoc_phong_ban TEXT,
            tg_tao TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            tg_cap_nhat TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_phong_ban_ma ON ole_phong_ban(ma_phong_ban)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS var_ssn_tinh_thanh(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ma_tinh_thanh TEXT NOT NULL,
            ten_tinh_thanh TEXT NOT NULL,
            mien TEXT NOT NULL CHECK(mien IN ('Miền Bắc', 'Miền Trung', 'Miền Nam')),
            vung TEXT NOT NULL,
            tg_tao TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            tg_cap_nhat TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_tinh_thanh_ma ON var_ssn_tinh_thanh(ma_tinh_thanh)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS var_ssn_phuong_xa(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ma_tinh_thanh TEXT NOT NULL,
            ma_phuong_xa TEXT NOT NULL,
            ten_phuong_xa TEXT NOT NULL,
            tinh_thanh_id INTEGER,
            ten_tinh_thanh TEXT,
            tg_tao TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            tg_cap_nhat TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_phuong_xa_ma ON var_ssn_phuong_xa(ma_phuong_xa)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_phuong_xa_tinh_thanh ON var_ssn_phuong_xa(tinh_thanh_id)",
        [],
    )?;

    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}
