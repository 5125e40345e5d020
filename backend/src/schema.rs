// Hand-written to match the columns enumerated in spec.md §3 — a
// greenfield schema, so there is no legacy-column autopatch step (see
// DESIGN.md's resolution of the matching Open Question in spec.md §9).

diesel::table! {
    hosts (id) {
        id -> Integer,
        address -> Text,
        port -> Integer,
        username -> Text,
        secret -> Text,
        description -> Nullable<Text>,
        sort_order -> Integer,
        hostname -> Nullable<Text>,
        version -> Nullable<Text>,
        model -> Nullable<Text>,
        last_sync -> Nullable<Timestamp>,
        status -> Text,
        cpu_percent -> Double,
        memory_percent -> Double,
        core_count -> Integer,
        total_memory_gb -> Double,
        storage_total_gb -> Double,
        storage_free_gb -> Double,
    }
}

diesel::table! {
    virtual_machines (id) {
        id -> Text,
        instance_uuid -> Text,
        name -> Text,
        host_address -> Text,
        power_state -> Text,
        primary_ip -> Nullable<Text>,
        guest_os -> Text,
        annotation -> Text,
        num_cpu -> Integer,
        memory_mb -> Integer,
        overall_cpu_mhz -> Integer,
        guest_memory_mb -> Integer,
        uptime_seconds -> BigInt,
        committed_disk_gb -> Double,
        provisioned_disk_gb -> Double,
        tools_status -> Text,
        datastore_name -> Text,
        config_path -> Text,
        last_sync -> Timestamp,
    }
}

diesel::table! {
    datastores (url) {
        url -> Text,
        name -> Text,
        kind -> Text,
        capacity_gb -> Double,
        free_gb -> Double,
        last_sync -> Timestamp,
    }
}

diesel::table! {
    credentials (id) {
        id -> Integer,
        alias -> Text,
        username -> Text,
        secret -> Text,
        description -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    tasks (id) {
        id -> Text,
        kind -> Text,
        target_id -> Nullable<Text>,
        status -> Text,
        progress -> Integer,
        message -> Text,
        result -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::allow_tables_to_appear_in_same_query!(hosts, virtual_machines, datastores, credentials, tasks,);
