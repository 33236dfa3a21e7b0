// Diesel table definitions; must match db/schema.rs.

diesel::table! {
    leads (id) {
        id -> Text,
        name -> Text,
        phone -> Text,
        email -> Text,
        school -> Text,
        district -> Text,
        gender -> Text,
        stream -> Text,
        bucket_id -> Nullable<Text>,
        custom_fields -> Text,
        assigned_to -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    users (id) {
        id -> Text,
        email -> Text,
        full_name -> Text,
        role -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    buckets (id) {
        id -> Text,
        name -> Text,
        field_keys -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    import_jobs (id) {
        id -> Text,
        job_type -> Text,
        status -> Text,
        total -> BigInt,
        processed -> BigInt,
        success_count -> BigInt,
        failed_count -> BigInt,
        errors_json -> Text,
        omitted_errors -> BigInt,
        message -> Nullable<Text>,
        bucket_id -> Nullable<Text>,
        created_by -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(leads, users, buckets, import_jobs);
